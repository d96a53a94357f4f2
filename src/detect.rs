use std::collections::BTreeSet;

use log::{debug, warn};
use serde_json::Value;

use crate::arbiter::ViewportArbiter;
use crate::cdp::CdpError;
use crate::page::{NodeId, PageSession};
use crate::rules::RuleOracle;
use crate::screenshot::ScreenshotTaker;

/// Languages the text heuristics are tuned for.
const SUPPORTED_LANGUAGES: [&str; 2] = ["en", "de"];

/// The literal the DOM text search looks for.
const SEARCH_TERM: &str = "cookie";

/// Upper bound on cookie-purge rounds; deletion can be reordered by the
/// browser, so the jar is re-read until empty.
const MAX_PURGE_PASSES: usize = 16;

/// Tags that are inline by default. Short-circuits the block-ancestor walk
/// before paying for a computed-style lookup in the page.
const INLINE_TAGS: [&str; 33] = [
    "a", "abbr", "acronym", "b", "bdo", "big", "br", "button", "cite", "code", "dfn", "em", "i",
    "img", "input", "kbd", "label", "map", "object", "output", "q", "samp", "script", "select",
    "small", "span", "strong", "sub", "sup", "textarea", "time", "tt", "var",
];

/// Walks to the nearest non-inline ancestor (or the document on exhaustion).
const BLOCK_ANCESTOR_PROBE: &str = "\
function closestBlockAncestor(elem) {
    function isInline(node) {
        return getComputedStyle(node).display == 'inline';
    }

    if (!elem) elem = this;
    while (elem && elem !== document && isInline(elem)) {
        elem = elem.parentNode;
    }
    return elem;
}";

/// Walks to the nearest `position: fixed` ancestor. Reaching the frame's
/// `html` element returns it; the caller decides what a frame boundary
/// means.
const FIXED_ANCESTOR_PROBE: &str = "\
function fixedAncestor(elem) {
    if (!elem) elem = this;
    while (elem && elem.parentNode !== document) {
        if (getComputedStyle(elem).position === 'fixed') {
            return elem;
        }
        elem = elem.parentNode;
    }
    return elem;
}";

/// Walks upward until the parent is meaningfully taller than its own chrome
/// around the child, then accepts the stop element only if it spans at
/// least the body's width. Cookie banners span the page but stay short;
/// this isolates the banner container without swallowing the document
/// chrome.
const FULL_WIDTH_ANCESTOR_PROBE: &str = "\
function fullWidthAncestor(elem) {
    function outerWidth(node) {
        const style = getComputedStyle(node);
        if (style.boxSizing == 'content-box') {
            return parseInt(style.width) +
                parseInt(style.paddingLeft) + parseInt(style.paddingRight) +
                parseInt(style.borderLeftWidth) + parseInt(style.borderRightWidth) +
                parseInt(style.marginLeft) + parseInt(style.marginRight);
        }
        return parseInt(style.width) +
            parseInt(style.marginLeft) + parseInt(style.marginRight);
    }

    function outerHeight(node) {
        const style = getComputedStyle(node);
        if (style.boxSizing == 'content-box') {
            return parseInt(style.height) +
                parseInt(style.paddingTop) + parseInt(style.paddingBottom) +
                parseInt(style.borderTopWidth) + parseInt(style.borderBottomWidth) +
                parseInt(style.marginTop) + parseInt(style.marginBottom);
        }
        return parseInt(style.height) +
            parseInt(style.marginTop) + parseInt(style.marginBottom);
    }

    function verticalSpacing(node) {
        const style = getComputedStyle(node);
        return parseInt(style.paddingTop) + parseInt(style.paddingBottom) +
            parseInt(style.borderTopWidth) + parseInt(style.borderBottomWidth) +
            parseInt(style.marginTop) + parseInt(style.marginBottom);
    }

    function wrapsMoreThanChild(parent, child) {
        let allowedIncrease = Math.max(0.25 * outerHeight(child), 20);
        return outerHeight(parent) - outerHeight(child) >
            verticalSpacing(parent) + allowedIncrease;
    }

    if (!elem) elem = this;
    while (elem && elem !== document) {
        let parent = elem.parentNode;
        if (wrapsMoreThanChild(parent, elem)) {
            break;
        }
        elem = parent;
    }

    if (parseInt(getComputedStyle(document.body).width) <= outerWidth(elem)) {
        return elem;
    }
    return false;
}";

/// Visibility predicate. Returns the visible element itself, a visible
/// descendant (zero-size fixed wrappers often hide a visible banner), or
/// `false`. Recursive, so it must also be installed at top level via
/// `Runtime.evaluate` before being invoked by handle.
const VISIBILITY_PROBE: &str = "\
function isVisible(elem) {
    if (!elem) elem = this;
    if (!(elem instanceof Element)) return false;
    let visible = true;
    const style = getComputedStyle(elem);

    // with these the children cannot be visible either
    if (style.display === 'none') return false;
    if (style.opacity < 0.1) return false;
    if (style.visibility !== 'visible') return false;

    // with these a child may still be visible, keep going
    if (elem.offsetWidth + elem.offsetHeight + elem.getBoundingClientRect().height +
        elem.getBoundingClientRect().width === 0) {
        visible = false;
    }
    if (elem.offsetWidth === 0 || elem.offsetHeight === 0) {
        visible = false;
    }
    const center = {
        x: elem.getBoundingClientRect().left + elem.offsetWidth / 2,
        y: elem.getBoundingClientRect().top + elem.offsetHeight / 2
    };
    if (center.x < 0) visible = false;
    if (center.x > (document.documentElement.clientWidth || window.innerWidth)) visible = false;
    if (center.y < 0) visible = false;
    if (center.y > (document.documentElement.clientHeight || window.innerHeight)) visible = false;

    if (visible === true) {
        let container = document.elementFromPoint(center.x, center.y);
        do {
            if (container === elem) return elem;
            if (!container) break;
        } while (container = container.parentNode);
    }

    if (!visible) {
        for (let i = 0; i < elem.childNodes.length; i++) {
            let visibleChild = isVisible(elem.childNodes[i]);
            if (visibleChild) {
                return visibleChild;
            }
        }
    }

    return false;
}";

/// Runs the cookie-notice detection pipeline on an opened page.
///
/// Three independent strategies feed candidate node sets: curated CSS
/// selectors from the rule oracle, text seeds promoted to fixed-positioned
/// ancestors, and text seeds promoted to full-width ancestors. Candidates
/// may overlap across strategies; labels keep the provenance apart.
pub struct NoticeDetector<'a> {
    page: &'a PageSession,
    rules: &'a RuleOracle,
    arbiter: &'a ViewportArbiter,
}

impl<'a> NoticeDetector<'a> {
    #[must_use]
    pub fn new(page: &'a PageSession, rules: &'a RuleOracle, arbiter: &'a ViewportArbiter) -> Self {
        Self {
            page,
            rules,
            arbiter,
        }
    }

    /// Run the full pipeline. Returns without touching the page when an
    /// outcome flag is already set (e.g. the primary request came back 4xx
    /// while the load idle was still running).
    ///
    /// # Errors
    ///
    /// Returns the first wire error; the caller folds it into the page's
    /// failure record.
    pub async fn detect(&self) -> Result<(), CdpError> {
        if self.page.with_result(|result| result.failed.is_some()) {
            return Ok(());
        }

        let language = self.detect_language().await?;
        self.page
            .with_result(|result| result.language = language.clone());
        let code = language.unwrap_or_else(|| "unknown".to_owned());
        if !SUPPORTED_LANGUAGES.contains(&code.as_str()) {
            self.page.with_result(|result| {
                result.set_skipped(format!("unimplemented language `{code}`"));
            });
            return Ok(());
        }

        // a consent-management API implies a notice exists somewhere
        let cmp_defined = self.is_cmp_defined().await?;
        self.page
            .with_result(|result| result.cmp_defined = cmp_defined);

        let rule_nodes = self.find_by_rules().await?;

        // install the recursive predicate before first invocation by handle
        self.page.evaluate(VISIBILITY_PROBE).await?;

        let seeds = self.find_text_seeds().await?;
        let seeds = self.filter_visible(seeds).await?;
        let mut block_seeds = BTreeSet::new();
        for seed in seeds {
            block_seeds.insert(self.closest_block_ancestor(seed).await?);
        }
        debug!(
            "{} rule nodes, {} text seeds",
            rule_nodes.len(),
            block_seeds.len()
        );

        let mut fixed = BTreeSet::new();
        for &seed in &block_seeds {
            if let Some(candidate) = self.fixed_parent_of(seed).await? {
                fixed.insert(candidate);
            }
        }
        let fixed = self.filter_visible(fixed).await?;

        let mut full_width = BTreeSet::new();
        for &seed in &block_seeds {
            if let Some(candidate) = self.full_width_parent_of(seed).await? {
                full_width.insert(candidate);
            }
        }
        let full_width = self.filter_visible(full_width).await?;

        {
            let _turn = self.arbiter.screenshot_turn().await;
            self.page.bring_to_front().await?;
            let shots = ScreenshotTaker::new(self.page);
            shots.capture("original").await?;
            // the rule set is trusted as-is; only promoted sets were
            // visibility-filtered above, and all sets are re-checked here so
            // highlights land on the actually-visible element
            self.capture_candidates(&shots, &rule_nodes, "rules").await?;
            self.capture_candidates(&shots, &fixed, "fixed-parent").await?;
            self.capture_candidates(&shots, &full_width, "full-width-parent")
                .await?;
        }

        let cookies = self.page.all_cookies().await?;
        self.page
            .with_result(|result| result.set_cookies("all", cookies));
        self.purge_cookies().await
    }

    async fn detect_language(&self) -> Result<Option<String>, CdpError> {
        let result = self.page.evaluate("document.body.innerText").await?;
        let text = result["value"].as_str().unwrap_or_default();
        Ok(identify_language(text))
    }

    async fn is_cmp_defined(&self) -> Result<bool, CdpError> {
        let result = self
            .page
            .evaluate("typeof window.__cmp !== 'undefined'")
            .await?;
        Ok(result["value"].as_bool().unwrap_or(false))
    }

    /// Strategy `rules`: every applicable selector against the document
    /// root, unioned. Not visibility-filtered — the curated rules are
    /// trusted.
    async fn find_by_rules(&self) -> Result<BTreeSet<NodeId>, CdpError> {
        let hostname = self.page.hostname().unwrap_or_default();
        let root = self.page.document_root().await?;
        let mut nodes = BTreeSet::new();
        for selector in self.rules.applicable_selectors(hostname) {
            for node_id in self.page.query_selector_all(root, selector).await? {
                nodes.insert(node_id);
            }
        }
        Ok(nodes)
    }

    /// Elements whose text mentions the search term.
    ///
    /// Scripts are paused for the duration of the search so dynamic
    /// mutations cannot invalidate handles mid-sequence. The XPath takes
    /// the parent of each matching text node, collapsing multi-text-node
    /// elements to one hit, and case-folds via `translate` rather than a
    /// locale-dependent lowercase.
    async fn find_text_seeds(&self) -> Result<Vec<NodeId>, CdpError> {
        self.page.set_script_execution_disabled(true).await?;
        let searched = self.page.search_nodes(&text_search_query(SEARCH_TERM)).await;
        let resumed = self.page.set_script_execution_disabled(false).await;
        let node_ids = searched?;
        resumed?;

        let mut seeds = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let name = self.page.node_name(node_id).await?;
            if name != "script" && name != "style" {
                seeds.push(node_id);
            }
        }
        Ok(seeds)
    }

    /// The nearest block ancestor, or the node itself when it already is
    /// one. Promoting a block element is a no-op, so this is idempotent.
    async fn closest_block_ancestor(&self, node_id: NodeId) -> Result<NodeId, CdpError> {
        let name = self.page.node_name(node_id).await?;
        if !INLINE_TAGS.contains(&name.as_str()) {
            return Ok(node_id);
        }
        let result = self.page.call_on_node(node_id, BLOCK_ANCESTOR_PROBE).await?;
        match self.node_from_probe(&result).await? {
            Some(ancestor) => Ok(ancestor),
            None => Ok(node_id),
        }
    }

    /// Strategy `fixed-parent` promotion for one seed.
    ///
    /// Reaching the root frame's `html` means no fixed ancestor exists;
    /// reaching a child frame's `html` promotes the frame owner element in
    /// the parent document — banners are often iframes that are themselves
    /// fixed-positioned in the host page.
    async fn fixed_parent_of(&self, node_id: NodeId) -> Result<Option<NodeId>, CdpError> {
        let result = self.page.call_on_node(node_id, FIXED_ANCESTOR_PROBE).await?;
        let Some(candidate) = self.node_from_probe(&result).await? else {
            return Ok(None);
        };
        if self.page.node_name(candidate).await? != "html" {
            return Ok(Some(candidate));
        }

        let Some(frame_id) = self.page.node_frame_id(candidate).await? else {
            return Ok(None);
        };
        if frame_id == self.page.root_frame_id().await? {
            return Ok(None);
        }
        Ok(Some(self.page.frame_owner(&frame_id).await?))
    }

    /// Strategy `full-width-parent` promotion for one seed.
    async fn full_width_parent_of(&self, node_id: NodeId) -> Result<Option<NodeId>, CdpError> {
        let result = self
            .page
            .call_on_node(node_id, FULL_WIDTH_ANCESTOR_PROBE)
            .await?;
        self.node_from_probe(&result).await
    }

    /// Whether the node is visible; when it is, the handle of the element
    /// that is actually visible (the node itself or a descendant).
    async fn visible_node(&self, node_id: NodeId) -> Result<Option<NodeId>, CdpError> {
        let result = self.page.call_on_node(node_id, VISIBILITY_PROBE).await?;
        self.node_from_probe(&result).await
    }

    /// Keep the nodes the visibility predicate accepts, preserving the
    /// original handles (descendant substitution happens at capture time).
    async fn filter_visible<I>(&self, nodes: I) -> Result<BTreeSet<NodeId>, CdpError>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut visible = BTreeSet::new();
        for node_id in nodes {
            if self.visible_node(node_id).await?.is_some() {
                visible.insert(node_id);
            }
        }
        Ok(visible)
    }

    /// One highlighted screenshot per visible candidate, labeled
    /// `{strategy}-{index}` with the index counting only captured shots.
    async fn capture_candidates(
        &self,
        shots: &ScreenshotTaker<'_>,
        nodes: &BTreeSet<NodeId>,
        strategy: &str,
    ) -> Result<(), CdpError> {
        let mut index = 0;
        for &node_id in nodes {
            let Some(visible) = self.visible_node(node_id).await? else {
                continue;
            };
            shots
                .capture_highlighted(visible, &format!("{strategy}-{index}"))
                .await?;
            index += 1;
        }
        Ok(())
    }

    /// A probe returns either an element (round-tripped to a node handle
    /// here) or a plain boolean meaning no match.
    async fn node_from_probe(&self, result: &Value) -> Result<Option<NodeId>, CdpError> {
        match result["objectId"].as_str() {
            Some(object_id) => Ok(Some(self.page.node_for_object(object_id).await?)),
            None => Ok(None),
        }
    }

    async fn purge_cookies(&self) -> Result<(), CdpError> {
        let mut passes = 0;
        loop {
            let cookies = self.page.all_cookies().await?;
            if cookies.is_empty() {
                return Ok(());
            }
            if passes == MAX_PURGE_PASSES {
                warn!(
                    "cookie purge did not converge after {MAX_PURGE_PASSES} passes, {} cookies left",
                    cookies.len()
                );
                return Ok(());
            }
            for cookie in &cookies {
                self.page
                    .delete_cookie(
                        cookie["name"].as_str().unwrap_or_default(),
                        cookie["domain"].as_str().unwrap_or_default(),
                        cookie["path"].as_str().unwrap_or_default(),
                    )
                    .await?;
            }
            passes += 1;
        }
    }
}

fn text_search_query(needle: &str) -> String {
    format!(
        "//body//*/text()[contains(translate(., \
         'ABCDEFGHIJKLMNOPQRSTUVWXYZ', 'abcdefghijklmnopqrstuvwxyz'), '{needle}')]/parent::*"
    )
}

/// ISO 639-1 code of the dominant language, falling back to the 639-3 code
/// when no two-letter form exists.
fn identify_language(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    let code3 = info.lang().code();
    match isolang::Language::from_639_3(code3).and_then(|lang| lang.to_639_1()) {
        Some(code1) => Some(code1.to_owned()),
        None => Some(code3.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_text_maps_to_en() {
        let text = "We use cookies on this website to ensure you get the best \
                    experience. Please accept our cookie policy before you \
                    continue reading the news and articles on this site.";
        assert_eq!(identify_language(text).as_deref(), Some("en"));
    }

    #[test]
    fn german_text_maps_to_de() {
        let text = "Wir verwenden Cookies, um Ihnen das beste Erlebnis auf \
                    unserer Webseite zu bieten. Bitte akzeptieren Sie unsere \
                    Richtlinien, bevor Sie die Nachrichten weiterlesen.";
        assert_eq!(identify_language(text).as_deref(), Some("de"));
    }

    #[test]
    fn japanese_text_maps_to_ja() {
        let text = "このウェブサイトではクッキーを使用しています。続行するには\
                    プライバシーポリシーに同意してください。";
        assert_eq!(identify_language(text).as_deref(), Some("ja"));
    }

    #[test]
    fn empty_text_is_unidentifiable() {
        assert_eq!(identify_language(""), None);
    }

    #[test]
    fn search_query_case_folds_via_translate() {
        let query = text_search_query("cookie");
        assert!(query.starts_with("//body//*/text()[contains(translate("));
        assert!(query.contains("'ABCDEFGHIJKLMNOPQRSTUVWXYZ', 'abcdefghijklmnopqrstuvwxyz'"));
        assert!(query.contains("'cookie'"));
        assert!(query.ends_with("/parent::*"));
    }

    #[test]
    fn inline_tag_list_matches_html_defaults() {
        for tag in ["span", "a", "b", "label", "textarea", "time"] {
            assert!(INLINE_TAGS.contains(&tag), "{tag} should be inline");
        }
        for tag in ["div", "p", "section", "iframe", "html", "ul"] {
            assert!(!INLINE_TAGS.contains(&tag), "{tag} should not be inline");
        }
    }

    #[test]
    fn probes_return_false_for_no_match() {
        // each geometry/visibility probe signals "no match" with a boolean
        // so the caller can distinguish it from an element result
        assert!(FULL_WIDTH_ANCESTOR_PROBE.contains("return false;"));
        assert!(VISIBILITY_PROBE.contains("return false;"));
    }

    #[test]
    fn full_width_probe_keeps_threshold_constants() {
        assert!(FULL_WIDTH_ANCESTOR_PROBE.contains("Math.max(0.25 * outerHeight(child), 20)"));
        assert!(FULL_WIDTH_ANCESTOR_PROBE.contains("getComputedStyle(document.body).width"));
    }

    #[test]
    fn visibility_probe_hard_rules_precede_child_descent() {
        let display = VISIBILITY_PROBE.find("display === 'none'").unwrap();
        let opacity = VISIBILITY_PROBE.find("style.opacity < 0.1").unwrap();
        let children = VISIBILITY_PROBE.find("elem.childNodes").unwrap();
        assert!(display < children);
        assert!(opacity < children);
    }
}
