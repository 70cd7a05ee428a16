//! Hostname construction for deployments.
//!
//! Every deployment gets up to three hostnames under the apex domain:
//!
//! ```text
//! {project}-git-{sha7}-{workspace}.{apex}       sticky=none         fixed to this commit
//! {project}-git-{branch}-{workspace}.{apex}     sticky=branch       follows the branch
//! {project}-{env}-{workspace}.{apex}            sticky=environment  follows the environment
//! ```
//!
//! Uploads without a commit get a random six-digit suffix in place of the
//! short sha so repeated uploads never collide.

use std::net::IpAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use keel_state::Sticky;

const SLUG_MAX_LEN: usize = 80;
const SHORT_SHA_LEN: usize = 7;

/// Lowercase, dash-separated form of `input`.
///
/// Runs of anything other than ASCII letters and digits collapse into a
/// single `-`. The result is at most 80 characters and never ends in `-`.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_sep = false;
    for c in input.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if pending_sep && !out.is_empty() {
        out.push('-');
    }
    out.truncate(SLUG_MAX_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Hostnames that never get a gateway config (development setups).
pub fn is_local_hostname(hostname: &str) -> bool {
    let host = hostname
        .rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(hostname, |(host, _)| host)
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }
    host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local")
}

/// One hostname a deployment should be reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub hostname: String,
    pub sticky: Sticky,
}

/// Slugs and git metadata a domain set is built from.
#[derive(Debug, Clone, Default)]
pub struct DomainInputs<'a> {
    pub project: &'a str,
    pub workspace: &'a str,
    pub environment: &'a str,
    pub git_commit_sha: Option<&'a str>,
    pub git_branch: Option<&'a str>,
}

/// Build the commit, branch and environment hostnames for a deployment.
pub fn domain_set(inputs: &DomainInputs<'_>, apex: &str) -> Vec<DomainSpec> {
    let project = slug(inputs.project);
    let workspace = slug(inputs.workspace);

    let commit = match inputs.git_commit_sha.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sha) => slug(&sha.chars().take(SHORT_SHA_LEN).collect::<String>()),
        None => rand::thread_rng().gen_range(100_000..1_000_000).to_string(),
    };

    let mut domains = vec![DomainSpec {
        hostname: format!("{project}-git-{commit}-{workspace}.{apex}"),
        sticky: Sticky::None,
    }];

    if let Some(branch) = inputs.git_branch.map(slug).filter(|b| !b.is_empty()) {
        domains.push(DomainSpec {
            hostname: format!("{project}-git-{branch}-{workspace}.{apex}"),
            sticky: Sticky::Branch,
        });
    }

    domains.push(DomainSpec {
        hostname: format!("{project}-{}-{workspace}.{apex}", slug(inputs.environment)),
        sticky: Sticky::Environment,
    });

    domains
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_examples() {
        assert_eq!(slug("Feature/Fix Bug!!"), "feature-fix-bug");
        assert_eq!(slug("  a___b  "), "a-b");
        assert_eq!(slug("main"), "main");
        assert_eq!(slug("--release--v2--"), "release-v2");
        assert_eq!(slug("!!!"), "");
    }

    #[test]
    fn slug_truncates_without_trailing_dash() {
        let long = format!("{}-{}", "a".repeat(79), "b".repeat(10));
        let s = slug(&long);
        assert_eq!(s.len(), 79);
        assert!(!s.ends_with('-'));
    }

    #[test]
    fn local_hostnames() {
        assert!(is_local_hostname("localhost"));
        assert!(is_local_hostname("api.localhost:3000"));
        assert!(is_local_hostname("printer.local"));
        assert!(is_local_hostname("127.0.0.1:8080"));
        assert!(is_local_hostname("[::1]"));
        assert!(!is_local_hostname("shop-git-abc1234-acme.keel.app"));
        assert!(!is_local_hostname("10.0.0.5"));
    }

    #[test]
    fn full_domain_set() {
        let inputs = DomainInputs {
            project: "shop",
            workspace: "acme",
            environment: "production",
            git_commit_sha: Some("abc1234def5678"),
            git_branch: Some("Feature/New Cart"),
        };
        let domains = domain_set(&inputs, "keel.app");
        assert_eq!(
            domains,
            vec![
                DomainSpec {
                    hostname: "shop-git-abc1234-acme.keel.app".into(),
                    sticky: Sticky::None,
                },
                DomainSpec {
                    hostname: "shop-git-feature-new-cart-acme.keel.app".into(),
                    sticky: Sticky::Branch,
                },
                DomainSpec {
                    hostname: "shop-production-acme.keel.app".into(),
                    sticky: Sticky::Environment,
                },
            ]
        );
    }

    #[test]
    fn upload_without_commit_gets_random_suffix() {
        let inputs = DomainInputs {
            project: "shop",
            workspace: "acme",
            environment: "preview",
            ..Default::default()
        };
        let domains = domain_set(&inputs, "keel.app");
        assert_eq!(domains.len(), 2);

        let commit = &domains[0].hostname;
        let suffix = commit
            .strip_prefix("shop-git-")
            .and_then(|rest| rest.strip_suffix("-acme.keel.app"))
            .unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(domains[1].sticky, Sticky::Environment);
    }
}
