use logmill_core::Context;

/// Context key naming the file or stream a record came from.
pub const PROVENANCE_KEY: &str = "source_file";

/// Split a `key=value` token. Tokens without exactly one `=` or with an
/// empty key are not pairs.
pub fn split_pair(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    if key.is_empty() || value.contains('=') {
        return None;
    }
    Some((key, value))
}

/// Collects the dynamic fields of a record.
pub struct ContextExtractor {
    source: String,
}

impl ContextExtractor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Merge structured context with `key=value` pairs scanned from the
    /// masked (pre-template) body. The first writer of a key wins, so
    /// structured values shadow scanned ones. The provenance key is always
    /// set to this extractor's source.
    pub fn extract(&self, masked_body: &str, structured: Option<&Context>) -> Context {
        let mut context = structured.cloned().unwrap_or_default();

        for token in masked_body.split_whitespace() {
            let Some((key, value)) = split_pair(token) else {
                continue;
            };
            let value = value.trim_end_matches([',', ';']);
            if !context.contains_key(key) {
                context.insert(key.to_string(), value.to_string());
            }
        }

        context.insert(PROVENANCE_KEY.to_string(), self.source.clone());
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("user_id=101"), Some(("user_id", "101")));
        assert_eq!(split_pair("flag="), Some(("flag", "")));
        assert_eq!(split_pair("plain"), None);
        assert_eq!(split_pair("=orphan"), None);
        assert_eq!(split_pair("a=b=c"), None);
    }

    #[test]
    fn test_extracts_pairs_in_order() {
        let ex = ContextExtractor::new("payment.log");
        let ctx = ex.extract("Payment processed for user_id=102 amount=25.00", None);
        let keys: Vec<&str> = ctx.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["user_id", "amount", "source_file"]);
        assert_eq!(ctx["user_id"], "102");
        assert_eq!(ctx["amount"], "25.00");
        assert_eq!(ctx["source_file"], "payment.log");
    }

    #[test]
    fn test_skips_malformed_tokens() {
        let ex = ContextExtractor::new("s");
        let ctx = ex.extract("query=a=b =x ok=1, done", None);
        assert!(!ctx.contains_key("query"));
        assert_eq!(ctx.get("ok").map(String::as_str), Some("1"));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_structured_wins_over_scanned() {
        let ex = ContextExtractor::new("auth.log");
        let mut structured = Context::new();
        structured.insert("user".into(), "admin".into());
        let ctx = ex.extract("user=guest ip=<IP>", Some(&structured));
        assert_eq!(ctx["user"], "admin");
        assert_eq!(ctx["ip"], "<IP>");
    }

    #[test]
    fn test_first_scanned_value_wins() {
        let ex = ContextExtractor::new("s");
        let ctx = ex.extract("retry=1 retry=2", None);
        assert_eq!(ctx["retry"], "1");
    }

    #[test]
    fn test_provenance_always_set() {
        let ex = ContextExtractor::new("stdin");
        let mut structured = Context::new();
        structured.insert(PROVENANCE_KEY.into(), "spoofed".into());
        let ctx = ex.extract("no pairs here", Some(&structured));
        assert_eq!(ctx[PROVENANCE_KEY], "stdin");
    }
}
