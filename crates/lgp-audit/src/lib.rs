//! Deterministic website-text audit and outreach composition.
//!
//! Raw text flows through [`extract_signals`] and [`detect_issues`] into an
//! [`AuditResult`]; [`compose_email`] maps those sentences back onto
//! [`IssueKey`]s and renders a reproducible subject and body.

use lgp_core::{AuditResult, ComposedEmail, IssueKey};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "lgp-audit";

pub const VALUE_PROP_TERMS: &[&str] = &[
    "help", "solve", "achieve", "result", "outcome", "benefit", "save", "grow", "increase",
];
pub const CTA_TERMS: &[&str] = &[
    "contact",
    "call",
    "schedule",
    "book",
    "get started",
    "free quote",
    "request",
    "consultation",
];
pub const TRUST_TERMS: &[&str] = &[
    "years",
    "experience",
    "certified",
    "guarantee",
    "testimonial",
    "review",
    "client",
    "trusted",
    "award",
];
pub const DIFFERENTIATION_TERMS: &[&str] = &[
    "unique",
    "only",
    "different",
    "unlike",
    "specialized",
    "exclusive",
    "proprietary",
];
pub const CONTACT_TERMS: &[&str] = &["email", "phone", "@", "call us"];

pub const SPARSE_BELOW_CHARS: usize = 200;
pub const DENSE_ABOVE_CHARS: usize = 2500;

pub const ISSUE_NO_VALUE_PROP: &str =
    "Homepage describes services but does not communicate clear outcomes or benefits for clients.";
pub const ISSUE_NO_CTA: &str = "No clear call-to-action guiding visitors to take the next step.";
pub const ISSUE_NO_TRUST: &str =
    "Missing trust signals like testimonials, certifications, or experience indicators.";
pub const ISSUE_NO_DIFFERENTIATION: &str =
    "Services section lists offerings without explaining what sets the business apart.";
pub const ISSUE_SPARSE: &str = "Homepage content is too sparse to communicate the offer effectively.";
pub const ISSUE_DENSE: &str =
    "Homepage is text-heavy without clear hierarchy, making it hard to scan quickly.";
pub const ISSUE_NO_CONTACT: &str = "Contact information is not prominently visible in the main content.";
pub const ISSUE_NO_SERVICES: &str = "No dedicated services section explaining what the business offers.";

/// Presence flags for each vocabulary group over the lower-cased page text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSignals {
    pub combined: String,
    pub has_value_prop: bool,
    pub has_cta: bool,
    pub has_trust: bool,
    pub has_differentiation: bool,
    pub has_contact: bool,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Plain substring containment: no tokenizing, stemming, or negation handling.
pub fn extract_signals(homepage_text: &str, services_text: &str) -> TextSignals {
    let combined = format!("{homepage_text} {services_text}").to_lowercase();
    TextSignals {
        has_value_prop: contains_any(&combined, VALUE_PROP_TERMS),
        has_cta: contains_any(&combined, CTA_TERMS),
        has_trust: contains_any(&combined, TRUST_TERMS),
        has_differentiation: contains_any(&combined, DIFFERENTIATION_TERMS),
        has_contact: contains_any(&combined, CONTACT_TERMS),
        combined,
    }
}

/// Runs the seven checks in fixed order and keeps the first four failures.
pub fn detect_issues(signals: &TextSignals, homepage_chars: usize, has_services_text: bool) -> AuditResult {
    let mut issues = Vec::new();

    if !signals.has_value_prop {
        issues.push(ISSUE_NO_VALUE_PROP);
    }
    if !signals.has_cta {
        issues.push(ISSUE_NO_CTA);
    }
    if !signals.has_trust {
        issues.push(ISSUE_NO_TRUST);
    }
    if has_services_text && !signals.has_differentiation {
        issues.push(ISSUE_NO_DIFFERENTIATION);
    }
    if homepage_chars < SPARSE_BELOW_CHARS {
        issues.push(ISSUE_SPARSE);
    } else if homepage_chars > DENSE_ABOVE_CHARS {
        issues.push(ISSUE_DENSE);
    }
    if !signals.has_contact {
        issues.push(ISSUE_NO_CONTACT);
    }
    if !has_services_text && !signals.combined.contains("service") {
        issues.push(ISSUE_NO_SERVICES);
    }

    AuditResult::from_issues(issues.into_iter().map(str::to_string).collect())
}

/// Convenience wrapper: signals + length heuristics for one page.
pub fn audit_text(homepage_text: &str, services_text: &str) -> AuditResult {
    let signals = extract_signals(homepage_text, services_text);
    detect_issues(
        &signals,
        homepage_text.chars().count(),
        !services_text.is_empty(),
    )
}

/// Ordered classification rules; the first key whose phrases match wins.
const KEY_RULES: &[(IssueKey, &[&str])] = &[
    (IssueKey::ValueProp, &["outcome", "benefit", "value"]),
    (IssueKey::Cta, &["call-to-action", "cta", "next step"]),
    (IssueKey::Trust, &["trust", "testimonial", "credential"]),
    (IssueKey::Differentiation, &["differentiation", "sets", "apart"]),
    (IssueKey::Sparse, &["sparse", "too brief", "too short"]),
    (IssueKey::Dense, &["text-heavy", "hierarchy", "dense"]),
    (IssueKey::Contact, &["contact"]),
    (IssueKey::Services, &["services section", "dedicated"]),
];

/// Classifies an issue sentence back onto its canonical key. `None` is a normal outcome.
pub fn map_issue_to_key(issue: &str) -> Option<IssueKey> {
    let lower = issue.to_lowercase();
    KEY_RULES
        .iter()
        .find(|(_, phrases)| contains_any(&lower, phrases))
        .map(|(key, _)| *key)
}

/// Distinct keys in first-seen order, at most two.
pub fn leading_issue_keys(audit: &AuditResult) -> Vec<IssueKey> {
    let mut keys = Vec::with_capacity(2);
    for issue in audit.issues() {
        if let Some(key) = map_issue_to_key(issue) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.len() == 2 {
            break;
        }
    }
    keys
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueStatement {
    pub statement: &'static str,
    pub impact: &'static str,
}

pub fn issue_statement(key: IssueKey) -> IssueStatement {
    let (statement, impact) = match key {
        IssueKey::ValueProp => (
            "The homepage explains what you do but not what clients get out of it",
            "which makes it easy to scroll past",
        ),
        IssueKey::Cta => (
            "There is no obvious next step for someone ready to reach out",
            "and that friction costs inquiries",
        ),
        IssueKey::Trust => (
            "There are no testimonials or proof of past work",
            "so new leads have little reason to trust the business",
        ),
        IssueKey::Differentiation => (
            "Services are listed but nothing explains what makes you different",
            "which weakens your position against competitors",
        ),
        IssueKey::Sparse => (
            "The homepage does not say enough to build confidence",
            "so people leave before understanding the value",
        ),
        IssueKey::Dense => (
            "There is a lot of text but no clear structure",
            "which buries the key points",
        ),
        IssueKey::Contact => (
            "Contact info is hard to find",
            "adding friction for anyone ready to reach out",
        ),
        IssueKey::Services => (
            "There is no clear section explaining what you offer",
            "leaving scope unclear",
        ),
    };
    IssueStatement { statement, impact }
}

const COMBINED_NARRATIVES: &[((IssueKey, IssueKey), &str)] = &[
    (
        (IssueKey::ValueProp, IssueKey::Cta),
        "The homepage explains what you do but not the outcomes. There is also no clear next step. That combination makes it easy for leads to leave without acting.",
    ),
    (
        (IssueKey::ValueProp, IssueKey::Trust),
        "The homepage focuses on services but not results, and there is no proof of past work. Both of those make it harder for someone new to reach out.",
    ),
    (
        (IssueKey::Cta, IssueKey::Trust),
        "There is no obvious way to take the next step, and no testimonials to back up the claims. That tends to cost inquiries.",
    ),
    (
        (IssueKey::Trust, IssueKey::Differentiation),
        "The site lacks proof of past work, and nothing explains what sets you apart. That makes the decision harder for anyone evaluating options.",
    ),
    (
        (IssueKey::Sparse, IssueKey::Cta),
        "The homepage is thin on content and there is no clear call to action. People are leaving before they even consider reaching out.",
    ),
    (
        (IssueKey::Dense, IssueKey::Cta),
        "There is a lot of text without structure, and no obvious next step. The key points get buried.",
    ),
];

/// Hand-authored sentence for an unordered pair of keys.
pub fn combined_narrative(a: IssueKey, b: IssueKey) -> Option<&'static str> {
    COMBINED_NARRATIVES
        .iter()
        .find(|((x, y), _)| (*x == a && *y == b) || (*x == b && *y == a))
        .map(|(_, text)| *text)
}

pub const NO_ISSUES_NARRATIVE: &str =
    "The foundation is there, but the messaging could work harder to convert interest into inquiries.";
const FALLBACK_TAIL: &str = "That could be affecting how leads perceive the business.";

/// Maps a seed string onto `0..len` using the first eight bytes of its SHA-256 digest.
///
/// Stable across runs, processes, and platforms. `len` must be non-zero.
pub fn stable_variant_index(seed: &str, len: usize) -> usize {
    let digest = Sha256::digest(seed.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % len as u64) as usize
}

fn pick<'a>(seed: &str, pool: &'a [String]) -> &'a str {
    &pool[stable_variant_index(seed, pool.len())]
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

fn issue_narrative(audit: &AuditResult) -> String {
    let keys = leading_issue_keys(audit);
    match keys.as_slice() {
        [] => match audit.issues().first() {
            Some(first) => format!("{}. {FALLBACK_TAIL}", first.trim_end_matches('.')),
            None => NO_ISSUES_NARRATIVE.to_string(),
        },
        [only] => {
            let s = issue_statement(*only);
            format!("{}, {}.", s.statement, s.impact)
        }
        [first, second, ..] => match combined_narrative(*first, *second) {
            Some(text) => text.to_string(),
            None => {
                let a = issue_statement(*first);
                let b = issue_statement(*second);
                format!(
                    "{}, {}. Also, {}, {}.",
                    a.statement,
                    a.impact,
                    b.statement.to_lowercase(),
                    b.impact
                )
            }
        },
    }
}

/// Renders subject and body. Same inputs always give byte-identical output.
pub fn compose_email(company_name: &str, niche: &str, audit: &AuditResult) -> ComposedEmail {
    let identity_seed = company_name.to_string();
    let niche_seed = format!("{company_name}{niche}");

    let openings = [
        format!("Looked at {company_name}'s site. There are a couple of things worth addressing."),
        format!("Went through {company_name}'s website. Two things could use attention."),
        format!("Checked out {company_name}'s site. Couple of quick notes."),
        format!("Looked at {company_name}'s website earlier. Worth flagging two things."),
    ];
    let ctas = [
        "I can outline what I would fix first.".to_string(),
        "Happy to send a short list of priorities.".to_string(),
        "I can share a quick breakdown of changes.".to_string(),
        "I have specific ideas if useful.".to_string(),
    ];
    let subjects = [
        format!("Quick thought on {company_name}"),
        format!("Re: {company_name}"),
        "Your website".to_string(),
        company_name.to_string(),
    ];
    let contexts = [
        format!("In {niche}, first impressions close deals."),
        format!("Most {niche} leads decide fast. Clarity wins."),
        format!("{} clients reach out to whoever looks credible.", capitalize(niche)),
        format!("Speed and trust matter in {niche}."),
    ];

    let opening = pick(&identity_seed, &openings);
    let subject = pick(&identity_seed, &subjects);
    let cta = pick(&niche_seed, &ctas);
    let context = pick(&niche_seed, &contexts);
    let narrative = issue_narrative(audit);

    ComposedEmail {
        subject: subject.to_string(),
        body: format!("Hi,\n\n{opening}\n\n{narrative}\n\n{context}\n\n{cta}\n\nBest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_SENTENCES: [(&str, IssueKey); 8] = [
        (ISSUE_NO_VALUE_PROP, IssueKey::ValueProp),
        (ISSUE_NO_CTA, IssueKey::Cta),
        (ISSUE_NO_TRUST, IssueKey::Trust),
        (ISSUE_NO_DIFFERENTIATION, IssueKey::Differentiation),
        (ISSUE_SPARSE, IssueKey::Sparse),
        (ISSUE_DENSE, IssueKey::Dense),
        (ISSUE_NO_CONTACT, IssueKey::Contact),
        (ISSUE_NO_SERVICES, IssueKey::Services),
    ];

    fn filler(len: usize) -> String {
        // Words chosen to avoid every vocabulary term.
        "lorem ipsum dolor sit amet ".chars().cycle().take(len).collect()
    }

    #[test]
    fn every_detector_sentence_maps_to_its_own_key() {
        for (sentence, key) in ALL_SENTENCES {
            assert_eq!(map_issue_to_key(sentence), Some(key), "{sentence}");
        }
        assert_eq!(map_issue_to_key("Font sizes are inconsistent."), None);
    }

    #[test]
    fn plumbing_scenario_reports_first_four_in_order() {
        let audit = audit_text("We are a plumbing company.", "");
        assert_eq!(
            audit.issues(),
            &[ISSUE_NO_VALUE_PROP, ISSUE_NO_CTA, ISSUE_NO_TRUST, ISSUE_SPARSE]
        );

        let email = compose_email("Acme Plumbing", "Plumbing", &audit);
        let lines: Vec<_> = email.body.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "Hi,");
        assert_eq!(lines[5], "Best");
        assert!(lines[1].contains("Acme Plumbing"));
        assert!(lines[3].contains("lumbing"));
        assert_eq!(
            lines[2],
            combined_narrative(IssueKey::ValueProp, IssueKey::Cta).unwrap()
        );
    }

    // Mixes words that satisfy other checks with words that match nothing.
    const CTA_FREE_WORDS: &[&str] = &[
        "we", "help", "clients", "grow", "save", "years", "experience", "certified", "reviews",
        "unique", "only", "email", "phone", "service", "plumbing", "lorem", "ipsum", "dolor",
        "results", "award", "trusted", "local", "team", "quality", "Our", "HOMEOWNERS", "20",
        "fast", "pipes", "leaks", "county", "\n", ".",
    ];

    fn page_text(words: usize) -> impl Strategy<Value = String> {
        (
            prop::collection::vec(prop::sample::select(CTA_FREE_WORDS), 0..words),
            "[a-z ]{0,40}",
        )
            .prop_map(|(words, noise)| format!("{} {noise}", words.join(" ")))
    }

    proptest! {
        #[test]
        fn missing_cta_is_always_reported_and_list_is_capped(
            homepage in page_text(700),
            services in page_text(60),
        ) {
            let combined = format!("{homepage} {services}").to_lowercase();
            prop_assume!(!CTA_TERMS.iter().any(|term| combined.contains(term)));

            let audit = audit_text(&homepage, &services);
            prop_assert!(audit.issues().iter().any(|i| i == ISSUE_NO_CTA));
            prop_assert!(audit.len() <= lgp_core::MAX_AUDIT_ISSUES);
        }

        #[test]
        fn any_cta_term_suppresses_the_cta_issue(
            homepage in page_text(700),
            term in prop::sample::select(CTA_TERMS),
            shout in any::<bool>(),
        ) {
            let term = if shout { term.to_uppercase() } else { term.to_string() };
            let audit = audit_text(&format!("{homepage} {term}"), "");
            prop_assert!(!audit.issues().iter().any(|i| i == ISSUE_NO_CTA));
            prop_assert!(audit.len() <= lgp_core::MAX_AUDIT_ISSUES);
        }
    }

    #[test]
    fn fixed_edge_texts_report_missing_cta() {
        for text in [String::new(), "short".to_string(), filler(1000), filler(3000)] {
            let audit = audit_text(&text, "");
            assert!(audit.issues().iter().any(|i| i == ISSUE_NO_CTA), "{text:?}");
            assert!(audit.len() <= lgp_core::MAX_AUDIT_ISSUES);
        }
    }

    #[test]
    fn length_checks_are_mutually_exclusive() {
        for len in [0, 199, 200, 2500, 2501, 5000] {
            let signals = extract_signals("", "");
            let audit = detect_issues(&signals, len, false);
            let sparse = audit.issues().iter().any(|i| i == ISSUE_SPARSE);
            let dense = audit.issues().iter().any(|i| i == ISSUE_DENSE);
            assert!(!(sparse && dense));
            assert_eq!(sparse, len < 200);
        }
        let rich = "We help clients grow. Contact us to book a consultation. 20 years experience, email or phone.";
        let audit = audit_text(&format!("{rich} {}", filler(2600)), "");
        assert!(audit.issues().iter().any(|i| i == ISSUE_DENSE));
    }

    #[test]
    fn differentiation_only_checked_when_services_text_present() {
        let home = "We help clients save money. Call us or email. Certified, 10 years.";
        let without = audit_text(home, "");
        assert!(!without.issues().iter().any(|i| i == ISSUE_NO_DIFFERENTIATION));

        let with = audit_text(home, "Drain cleaning. Pipe repair.");
        assert_eq!(with.issues()[0], ISSUE_NO_DIFFERENTIATION);
    }

    #[test]
    fn services_word_in_homepage_suppresses_services_issue() {
        let audit = audit_text("Our service area covers the whole county. Contact us.", "");
        assert!(!audit.issues().iter().any(|i| i == ISSUE_NO_SERVICES));
    }

    #[test]
    fn leading_keys_dedupe_and_preserve_order() {
        let audit = AuditResult::from_issues(vec![
            "Font sizes are inconsistent.".into(),
            ISSUE_NO_TRUST.into(),
            "Trust badges look dated.".into(),
            ISSUE_NO_CONTACT.into(),
        ]);
        assert_eq!(leading_issue_keys(&audit), vec![IssueKey::Trust, IssueKey::Contact]);
    }

    #[test]
    fn combined_narrative_is_used_in_either_order() {
        let forward = AuditResult::from_issues(vec![ISSUE_NO_TRUST.into(), ISSUE_NO_DIFFERENTIATION.into()]);
        let reverse = AuditResult::from_issues(vec![ISSUE_NO_DIFFERENTIATION.into(), ISSUE_NO_TRUST.into()]);
        let authored = combined_narrative(IssueKey::Trust, IssueKey::Differentiation).unwrap();
        for audit in [forward, reverse] {
            let body = compose_email("Northwind", "Legal Services", &audit).body;
            assert!(body.contains(authored));
            assert!(!body.contains("Also,"));
        }
    }

    #[test]
    fn unauthored_pair_is_synthesized() {
        let audit = AuditResult::from_issues(vec![ISSUE_NO_CONTACT.into(), ISSUE_NO_SERVICES.into()]);
        let body = compose_email("Northwind", "Roofing", &audit).body;
        assert!(body.contains(
            "Contact info is hard to find, adding friction for anyone ready to reach out. Also, there is no clear section explaining what you offer, leaving scope unclear."
        ));
    }

    #[test]
    fn single_key_and_unmapped_fallbacks() {
        let single = AuditResult::from_issues(vec![ISSUE_DENSE.into()]);
        assert!(compose_email("A", "B", &single)
            .body
            .contains("There is a lot of text but no clear structure, which buries the key points."));

        let unmapped = AuditResult::from_issues(vec!["Font sizes are inconsistent...".into()]);
        assert!(compose_email("A", "B", &unmapped).body.contains(
            "Font sizes are inconsistent. That could be affecting how leads perceive the business."
        ));
    }

    #[test]
    fn empty_audit_uses_foundation_sentence() {
        let email = compose_email("Acme", "Dental", &AuditResult::default());
        assert!(email.body.contains(NO_ISSUES_NARRATIVE));
        assert_eq!(email.body.lines().filter(|l| !l.is_empty()).count(), 6);
    }

    #[test]
    fn composition_is_deterministic() {
        let audit = audit_text("Tiny page", "");
        let a = compose_email("Acme HVAC", "HVAC", &audit);
        let b = compose_email("Acme HVAC", "HVAC", &audit);
        assert_eq!(a, b);
    }

    #[test]
    fn variant_index_is_pinned_and_in_range() {
        // SHA-256("abc") starts with ba7816bf8f01cfea.
        assert_eq!(stable_variant_index("abc", 4), (0xba7816bf8f01cfeau64 % 4) as usize);
        for seed in ["", "Acme", "Acme Plumbing", "Zeta Dental"] {
            assert!(stable_variant_index(seed, 4) < 4);
        }
    }

    #[test]
    fn context_line_capitalizes_niche() {
        assert_eq!(capitalize("real estate"), "Real estate");
        assert_eq!(capitalize("HVAC"), "Hvac");
        assert_eq!(capitalize(""), "");
    }
}
