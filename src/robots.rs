//! Robots.txt parsing and longest-prefix allow/disallow evaluation.

use std::time::Duration;

/// Where a policy came from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsSource {
    /// Parsed from a fetched robots.txt body.
    Fetched,
    /// robots.txt missing or unreachable; everything allowed.
    AllowAll,
    /// Robots compliance disabled by the operator.
    Disabled,
}

#[derive(Debug, Default)]
struct AgentGroup {
    /// Lowercased user-agent tokens this group applies to.
    agents: Vec<String>,
    allow: Vec<String>,
    disallow: Vec<String>,
    crawl_delay_ms: Option<u64>,
}

/// Immutable robots decision table for one origin.
#[derive(Debug)]
pub struct RobotsPolicy {
    allow: Vec<String>,
    disallow: Vec<String>,
    crawl_delay_ms: Option<u64>,
    pub source: RobotsSource,
}

impl RobotsPolicy {
    /// Policy that allows every path.
    pub fn allow_all(source: RobotsSource) -> Self {
        Self {
            allow: Vec::new(),
            disallow: Vec::new(),
            crawl_delay_ms: None,
            source,
        }
    }

    /// Parse a robots.txt body and select the group matching `user_agent`.
    ///
    /// Selection order: exact lowercase match, then any non-`*` token that is
    /// a substring of the UA, then `*`, then allow-all. Unknown directives
    /// are ignored; this function never fails.
    pub fn parse(body: &str, user_agent: &str) -> Self {
        let groups = parse_groups(body);
        let ua = user_agent.to_lowercase();

        let selected = groups
            .iter()
            .find(|g| g.agents.iter().any(|a| *a == ua))
            .or_else(|| {
                groups
                    .iter()
                    .find(|g| g.agents.iter().any(|a| a != "*" && ua.contains(a.as_str())))
            })
            .or_else(|| groups.iter().find(|g| g.agents.iter().any(|a| a == "*")));

        match selected {
            Some(group) => Self {
                allow: group.allow.clone(),
                disallow: group.disallow.clone(),
                crawl_delay_ms: group.crawl_delay_ms,
                source: RobotsSource::Fetched,
            },
            None => Self::allow_all(RobotsSource::Fetched),
        }
    }

    /// Longest matching Allow prefix vs. longest matching Disallow prefix;
    /// ties (including no match at all) go to allow.
    pub fn is_allowed(&self, path: &str) -> bool {
        let allow_len = longest_prefix(&self.allow, path);
        let disallow_len = longest_prefix(&self.disallow, path);
        if allow_len == 0 && disallow_len == 0 {
            return true;
        }
        allow_len >= disallow_len
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay_ms.map(Duration::from_millis)
    }

    /// Effective spacing: the stricter of the user delay and robots delay.
    pub fn effective_delay(&self, user_delay: Duration) -> Duration {
        self.crawl_delay().map_or(user_delay, |d| d.max(user_delay))
    }
}

fn longest_prefix(rules: &[String], path: &str) -> usize {
    rules
        .iter()
        .filter(|rule| path.starts_with(rule.as_str()))
        .map(|rule| rule.len())
        .max()
        .unwrap_or(0)
}

fn parse_groups(body: &str) -> Vec<AgentGroup> {
    let mut groups: Vec<AgentGroup> = Vec::new();
    // True while consecutive User-agent lines extend the current group.
    let mut collecting_agents = false;

    for raw in body.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let (directive, value) = match line.split_once(':') {
            Some((d, v)) => (d.trim().to_lowercase(), v.trim()),
            None => continue,
        };

        match directive.as_str() {
            "user-agent" => {
                if value.is_empty() {
                    continue;
                }
                if !collecting_agents {
                    groups.push(AgentGroup::default());
                    collecting_agents = true;
                }
                if let Some(group) = groups.last_mut() {
                    group.agents.push(value.to_lowercase());
                }
            }
            "allow" | "disallow" => {
                collecting_agents = false;
                if value.is_empty() {
                    continue;
                }
                let rule = if value.starts_with('/') {
                    value.to_string()
                } else {
                    format!("/{value}")
                };
                // Rules before any User-agent line apply to `*`.
                if groups.is_empty() {
                    let mut implicit = AgentGroup::default();
                    implicit.agents.push("*".to_string());
                    groups.push(implicit);
                }
                if let Some(group) = groups.last_mut() {
                    if directive == "allow" {
                        group.allow.push(rule);
                    } else {
                        group.disallow.push(rule);
                    }
                }
            }
            "crawl-delay" => {
                collecting_agents = false;
                if groups.is_empty() {
                    let mut implicit = AgentGroup::default();
                    implicit.agents.push("*".to_string());
                    groups.push(implicit);
                }
                if let (Some(group), Ok(seconds)) = (groups.last_mut(), value.parse::<f64>()) {
                    if seconds.is_finite() && seconds >= 0.0 {
                        // Round half-up to milliseconds.
                        group.crawl_delay_ms = Some((seconds * 1000.0).round() as u64);
                    }
                }
            }
            _ => {
                collecting_agents = false;
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "\
# mirror rules
User-agent: *
Disallow: /private/
Allow: /private/public
Crawl-delay: 1.5

User-agent: strictbot
Disallow: /
";

    #[test]
    fn test_longest_prefix_decides() {
        let policy = RobotsPolicy::parse(BODY, "mdmirror/0.3");
        assert!(policy.is_allowed("/docs/intro"));
        assert!(!policy.is_allowed("/private/intro"));
        assert!(policy.is_allowed("/private/public/page"));
    }

    #[test]
    fn test_tie_goes_to_allow() {
        let body = "User-agent: *\nAllow: /a\nDisallow: /a\n";
        let policy = RobotsPolicy::parse(body, "anybot");
        assert!(policy.is_allowed("/a/page"));
    }

    #[test]
    fn test_no_rules_allows() {
        let policy = RobotsPolicy::parse("", "anybot");
        assert!(policy.is_allowed("/anything"));
    }

    #[test]
    fn test_agent_substring_match() {
        let body = "User-agent: strictbot\nDisallow: /\n\nUser-agent: *\nDisallow: /tmp/\n";
        let strict = RobotsPolicy::parse(body, "StrictBot/2.0 (+test)");
        assert!(!strict.is_allowed("/docs"));
        let wildcard = RobotsPolicy::parse(body, "otherbot");
        assert!(wildcard.is_allowed("/docs"));
        assert!(!wildcard.is_allowed("/tmp/file"));
    }

    #[test]
    fn test_exact_match_preferred_over_substring() {
        let body = "\
User-agent: bot
Disallow: /a/

User-agent: mybot
Disallow: /b/
";
        let policy = RobotsPolicy::parse(body, "mybot");
        assert!(policy.is_allowed("/a/x"));
        assert!(!policy.is_allowed("/b/x"));
    }

    #[test]
    fn test_crawl_delay_fractional_rounds_to_ms() {
        let policy = RobotsPolicy::parse(BODY, "anybot");
        assert_eq!(policy.crawl_delay(), Some(Duration::from_millis(1500)));
        assert_eq!(
            policy.effective_delay(Duration::from_millis(200)),
            Duration::from_millis(1500)
        );
        assert_eq!(
            policy.effective_delay(Duration::from_millis(2000)),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn test_noisy_file_never_fails() {
        let body = "Sitemap https://x/s.xml\nnonsense line\nDisallow: private\nUnknown: 7\n";
        let policy = RobotsPolicy::parse(body, "anybot");
        // Value without a leading slash is normalized to one.
        assert!(!policy.is_allowed("/private/x"));
        assert!(policy.is_allowed("/docs"));
    }

    #[test]
    fn test_adding_longer_allow_is_monotone() {
        let without = RobotsPolicy::parse("User-agent: *\nDisallow: /a/\n", "bot");
        let with = RobotsPolicy::parse("User-agent: *\nDisallow: /a/\nAllow: /a/b\n", "bot");
        assert!(!without.is_allowed("/a/b/c"));
        assert!(with.is_allowed("/a/b/c"));
        // Previously allowed paths stay allowed.
        assert!(with.is_allowed("/elsewhere"));
    }
}
