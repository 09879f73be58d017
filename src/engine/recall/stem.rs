//! Tokenization and light stemming for the lexical index.
//!
//! Simplified Porter suffix rules plus an irregular-verb table and
//! month-name normalization (`january` → `1`). Deliberately cheap: the
//! index and the query pass through the same pipeline, so consistency
//! matters more than linguistic fidelity.

/// Lowercase alphanumeric tokens; everything else is a separator.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

const IRREGULAR_VERBS: &[(&str, &str)] = &[
    ("went", "go"),
    ("gone", "go"),
    ("said", "say"),
    ("told", "tell"),
    ("saw", "see"),
    ("seen", "see"),
    ("made", "make"),
    ("took", "take"),
    ("taken", "take"),
    ("got", "get"),
    ("gotten", "get"),
    ("gave", "give"),
    ("given", "give"),
    ("found", "find"),
    ("thought", "think"),
    ("knew", "know"),
    ("known", "know"),
    ("came", "come"),
    ("meant", "mean"),
    ("kept", "keep"),
    ("left", "leave"),
    ("felt", "feel"),
    ("brought", "bring"),
    ("began", "begin"),
    ("begun", "begin"),
    ("wrote", "write"),
    ("written", "write"),
    ("ran", "run"),
    ("ate", "eat"),
    ("chose", "choose"),
    ("chosen", "choose"),
    ("spoke", "speak"),
    ("met", "meet"),
    ("paid", "pay"),
    ("sent", "send"),
    ("built", "build"),
    ("held", "hold"),
    ("did", "do"),
    ("done", "do"),
    ("had", "have"),
    ("has", "have"),
    ("was", "be"),
    ("were", "be"),
    ("been", "be"),
    ("is", "be"),
    ("are", "be"),
];

const MONTHS: &[(&str, &str)] = &[
    ("january", "1"),
    ("february", "2"),
    ("march", "3"),
    ("april", "4"),
    ("may", "5"),
    ("june", "6"),
    ("july", "7"),
    ("august", "8"),
    ("september", "9"),
    ("october", "10"),
    ("november", "11"),
    ("december", "12"),
    ("jan", "1"),
    ("feb", "2"),
    ("mar", "3"),
    ("apr", "4"),
    ("jun", "6"),
    ("jul", "7"),
    ("aug", "8"),
    ("sep", "9"),
    ("sept", "9"),
    ("oct", "10"),
    ("nov", "11"),
    ("dec", "12"),
];

/// Normalize a month name to its number, if it is one.
pub fn normalize_month(token: &str) -> Option<&'static str> {
    MONTHS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, num)| *num)
}

/// Stem one token: irregular verbs first, then months, then the ordered
/// suffix rules. Pure-numeric tokens drop leading zeros so `01` and the
/// normalized `january` meet at `1`.
pub fn stem(token: &str) -> String {
    if let Some((_, lemma)) = IRREGULAR_VERBS.iter().find(|(form, _)| *form == token) {
        return (*lemma).to_string();
    }
    if let Some(num) = normalize_month(token) {
        return num.to_string();
    }
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        let trimmed = token.trim_start_matches('0');
        return if trimmed.is_empty() { "0" } else { trimmed }.to_string();
    }

    let t = token;
    if let Some(base) = t.strip_suffix("ies") {
        if base.len() >= 2 {
            return format!("{}y", base);
        }
    }
    if let Some(base) = t.strip_suffix("sses") {
        return format!("{}ss", base);
    }
    if let Some(base) = t.strip_suffix("ing") {
        if base.len() >= 3 {
            // Undouble a trailing consonant pair (running → run).
            let bytes = base.as_bytes();
            let n = bytes.len();
            if n >= 2 && bytes[n - 1] == bytes[n - 2] && !is_vowel(bytes[n - 1]) {
                return base[..n - 1].to_string();
            }
            return base.to_string();
        }
    }
    if let Some(base) = t.strip_suffix("ed") {
        if base.len() >= 3 {
            let bytes = base.as_bytes();
            let n = bytes.len();
            if n >= 2 && bytes[n - 1] == bytes[n - 2] && !is_vowel(bytes[n - 1]) {
                return base[..n - 1].to_string();
            }
            return base.to_string();
        }
    }
    if let Some(base) = t.strip_suffix("ly") {
        if base.len() >= 3 {
            return base.to_string();
        }
    }
    if let Some(base) = t.strip_suffix("es") {
        if base.len() >= 3 && (base.ends_with('x') || base.ends_with("ch") || base.ends_with("sh"))
        {
            return base.to_string();
        }
    }
    if t.ends_with('s') && !t.ends_with("ss") && t.len() >= 4 {
        return t[..t.len() - 1].to_string();
    }
    t.to_string()
}

fn is_vowel(b: u8) -> bool {
    matches!(b, b'a' | b'e' | b'i' | b'o' | b'u')
}

/// Tokenize and stem in one pass.
pub fn stem_tokens(text: &str) -> Vec<String> {
    tokenize(text).iter().map(|t| stem(t)).collect()
}

pub const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "of", "to", "in", "on", "at", "for", "with", "by",
    "from", "as", "be", "is", "are", "was", "were", "it", "its", "this", "that", "these", "those",
    "i", "you", "he", "she", "we", "they", "his", "her", "their", "our", "your", "my", "me",
    "him", "them", "us", "do", "did", "does", "have", "has", "had", "not", "no", "so", "if",
    "then", "than", "there", "here", "what", "which", "who", "whom", "when", "where", "why",
    "how", "all", "any", "some", "ever", "about", "into", "over", "under", "again", "also",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Use OAuth2, for login!"),
            vec!["use", "oauth2", "for", "login"]
        );
    }

    #[test]
    fn irregular_verbs_lemmatized() {
        assert_eq!(stem("went"), "go");
        assert_eq!(stem("said"), "say");
        assert_eq!(stem("chose"), "choose");
    }

    #[test]
    fn months_normalize_to_numbers() {
        assert_eq!(stem("january"), "1");
        assert_eq!(stem("dec"), "12");
    }

    #[test]
    fn suffix_rules() {
        assert_eq!(stem("policies"), "policy");
        assert_eq!(stem("running"), "run");
        assert_eq!(stem("deployed"), "deploy");
        assert_eq!(stem("quickly"), "quick");
        assert_eq!(stem("migrations"), "migration");
        assert_eq!(stem("pass"), "pass");
    }

    #[test]
    fn inflected_forms_share_a_stem() {
        assert_eq!(stem("approved"), stem("approving"));
        assert_eq!(stem("deploys"), stem("deploy"));
    }
}
