//! Matching-vocabulary derivation for techniques.

use std::collections::BTreeSet;

/// Tokens never useful as matching keywords.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "for", "from", "has",
    "have", "how", "its", "may", "more", "not", "of", "on", "or", "other", "over", "such", "than",
    "that", "the", "their", "then", "these", "they", "this", "through", "to", "use", "used",
    "using", "via", "was", "when", "where", "which", "while", "will", "with", "within",
];

/// Fixed security vocabulary always kept when present in technique text.
pub const CYBER_VOCABULARY: &[&str] = &[
    "adversary", "backdoor", "beacon", "botnet", "breach", "credential", "dropper", "encryption",
    "escalation", "exfiltration", "exploit", "implant", "injection", "keylogger", "lateral",
    "malware", "obfuscation", "payload", "persistence", "phishing", "ransomware", "reconnaissance",
    "registry", "rootkit", "shellcode", "spearphishing", "trojan", "vulnerability",
];

/// File suffixes marking a token as a technical term.
const FILE_SUFFIXES: &[&str] = &[
    ".bat", ".dll", ".doc", ".docx", ".exe", ".hta", ".js", ".lnk", ".msi", ".ps1", ".py", ".sh",
    ".sys", ".vbs", ".xls", ".zip",
];

/// Derive the lowercased keyword set for a technique from its name and
/// description: tokenized words minus stop-words and short tokens, unioned
/// with heuristically extracted technical terms.
pub fn derive_keywords(name: &str, description: &str) -> Vec<String> {
    let mut keywords: BTreeSet<String> = BTreeSet::new();

    let combined = format!("{} {}", name, description);
    for raw in combined.split(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_') {
        let token = raw.trim_matches(|c: char| c == '.' || c == '-' || c == '_');
        if token.len() <= 2 {
            continue;
        }
        let lower = token.to_lowercase();
        if STOP_WORDS.contains(&lower.as_str()) {
            continue;
        }
        if is_technical_term(token) || CYBER_VOCABULARY.contains(&lower.as_str()) {
            keywords.insert(lower);
            continue;
        }
        // Plain words qualify too once stop-words are gone; keep the ones
        // long enough to be distinctive.
        if lower.len() >= 4 && lower.chars().all(|c| c.is_ascii_alphabetic()) {
            keywords.insert(lower);
        }
    }

    // Multi-word technique names are strong signals as phrases.
    let name_lower = name.trim().to_lowercase();
    if name_lower.split_whitespace().count() > 1 {
        keywords.insert(name_lower);
    }

    keywords.into_iter().collect()
}

/// Mixed-case identifiers, digit-bearing tokens and file names read as
/// technical terms regardless of length.
fn is_technical_term(token: &str) -> bool {
    let has_upper = token.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = token.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower && !token.chars().next().map(char::is_uppercase).unwrap_or(false) {
        return true;
    }
    if has_upper && has_lower && token.chars().skip(1).any(|c| c.is_ascii_uppercase()) {
        return true;
    }
    if token.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    let lower = token.to_lowercase();
    FILE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}
