use std::path::Path;

/// One element-hiding rule: a CSS selector plus its domain scope.
#[derive(Debug, Clone)]
pub struct SelectorRule {
    selector: String,
    /// Positive domain scope. Exclusion entries (`~` prefix) are dropped at
    /// parse time: on those sites the notice exists, the upstream list just
    /// cannot remove it cleanly — and we want to find it, not hide it.
    included: Vec<String>,
}

impl SelectorRule {
    /// Whether this rule applies to the given hostname.
    ///
    /// A rule with no positive domain scope applies everywhere (this covers
    /// both unscoped rules and rules whose scope was exclusion-only).
    /// Otherwise the rule applies iff any included domain appears as a
    /// substring of the hostname.
    #[must_use]
    pub fn applies_to(&self, hostname: &str) -> bool {
        if self.included.is_empty() {
            return true;
        }
        self.included.iter().any(|domain| hostname.contains(domain))
    }

    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }
}

/// The set of element-hiding rules from a cookie-notice filter list.
///
/// Answers one question: which CSS selectors may match a cookie notice on a
/// given host. Immutable after construction and freely shared across
/// workers. No scoring — every returned selector is an equal positive.
#[derive(Debug, Default)]
pub struct RuleOracle {
    rules: Vec<SelectorRule>,
}

impl RuleOracle {
    /// Load a filter list from disk.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be read.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parse filter-list text, keeping only element-hiding (CSS) rules.
    ///
    /// Comments (`!`), section headers (`[...]`), exception rules (`#@#`),
    /// and network filter lines are skipped; only `domains##selector` lines
    /// survive.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let rules = text.lines().filter_map(parse_line).collect();
        Self { rules }
    }

    /// The selectors applicable to `hostname`, in list order.
    #[must_use]
    pub fn applicable_selectors(&self, hostname: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(hostname))
            .map(SelectorRule::selector)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_line(line: &str) -> Option<SelectorRule> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
        return None;
    }
    // `#@#` never contains `##`, so exception rules fall out here too
    let (domains, selector) = line.split_once("##")?;
    let selector = selector.trim();
    if selector.is_empty() {
        return None;
    }

    let included = domains
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && !entry.starts_with('~'))
        .map(str::to_owned)
        .collect();

    Some(SelectorRule {
        selector: selector.to_owned(),
        included,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal_rule_applies_everywhere() {
        let oracle = RuleOracle::parse("##.cookie-banner\n");
        assert_eq!(
            oracle.applicable_selectors("example.com"),
            vec![".cookie-banner"]
        );
        assert_eq!(
            oracle.applicable_selectors("totally-unrelated.org"),
            vec![".cookie-banner"]
        );
    }

    #[test]
    fn exclusion_only_rule_applies_everywhere() {
        let oracle = RuleOracle::parse("~broken.example##.consent\n");
        assert_eq!(oracle.applicable_selectors("broken.example"), vec![".consent"]);
        assert_eq!(oracle.applicable_selectors("other.example"), vec![".consent"]);
    }

    #[test]
    fn positive_domain_matches_by_substring() {
        let oracle = RuleOracle::parse("zeit.de##.cookie-hinweis\n");
        assert_eq!(
            oracle.applicable_selectors("www.zeit.de"),
            vec![".cookie-hinweis"]
        );
        assert!(oracle.applicable_selectors("spiegel.de").is_empty());
    }

    #[test]
    fn mixed_scope_ignores_exclusions() {
        let oracle = RuleOracle::parse("zeit.de,~m.zeit.de##.banner\n");
        // the positive domain decides; exclusion entries are dropped
        assert_eq!(oracle.applicable_selectors("m.zeit.de"), vec![".banner"]);
        assert!(oracle.applicable_selectors("spiegel.de").is_empty());
    }

    #[test]
    fn comments_headers_and_network_filters_are_skipped() {
        let text = "\
! title: cookie notice rules
[Adblock Plus 2.0]
||ads.example.com^
example.com##.banner
";
        let oracle = RuleOracle::parse(text);
        assert_eq!(oracle.len(), 1);
        assert_eq!(oracle.applicable_selectors("example.com"), vec![".banner"]);
    }

    #[test]
    fn exception_rules_are_skipped() {
        let oracle = RuleOracle::parse("example.com#@#.banner\n");
        assert!(oracle.is_empty());
    }

    #[test]
    fn bare_id_selector_with_no_domains() {
        let oracle = RuleOracle::parse("###cookieConsent\n");
        assert_eq!(
            oracle.applicable_selectors("anything.example"),
            vec!["#cookieConsent"]
        );
    }

    #[test]
    fn multiple_positive_domains_any_match() {
        let oracle = RuleOracle::parse("zeit.de,spiegel.de##.notice\n");
        assert_eq!(oracle.applicable_selectors("www.spiegel.de"), vec![".notice"]);
        assert_eq!(oracle.applicable_selectors("zeit.de"), vec![".notice"]);
        assert!(oracle.applicable_selectors("faz.net").is_empty());
    }

    #[test]
    fn selectors_keep_list_order() {
        let text = "##.first\n##.second\nexample.com##.third\n";
        let oracle = RuleOracle::parse(text);
        assert_eq!(
            oracle.applicable_selectors("example.com"),
            vec![".first", ".second", ".third"]
        );
    }
}
