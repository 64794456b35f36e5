use std::borrow::Cow;
use std::sync::LazyLock;

use logmill_config::MaskerConfig;
use logmill_core::Context;
use regex::{Captures, Regex};

/// Sensitive value classes, in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiClass {
    Email,
    CreditCard,
    Ssn,
    Ipv4,
}

impl PiiClass {
    pub const ORDER: [PiiClass; 4] = [
        PiiClass::Email,
        PiiClass::CreditCard,
        PiiClass::Ssn,
        PiiClass::Ipv4,
    ];

    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::Email => "<EMAIL>",
            Self::CreditCard => "<CARD>",
            Self::Ssn => "<SSN>",
            Self::Ipv4 => "<IP>",
        }
    }

    fn regex(&self) -> &'static Regex {
        static RE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap()
        });
        static RE_CARD: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"\b\d(?:[ \-]?\d){12,18}\b").unwrap());
        static RE_SSN: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
        static RE_IPV4: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(
                r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
            )
            .unwrap()
        });

        match self {
            Self::Email => &RE_EMAIL,
            Self::CreditCard => &RE_CARD,
            Self::Ssn => &RE_SSN,
            Self::Ipv4 => &RE_IPV4,
        }
    }

    fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self {
            // Only digit runs passing the Luhn check count as card numbers.
            Self::CreditCard => self.regex().replace_all(text, |caps: &Captures| {
                let m = &caps[0];
                if luhn_valid(m) {
                    self.placeholder().to_string()
                } else {
                    m.to_string()
                }
            }),
            _ => self.regex().replace_all(text, self.placeholder()),
        }
    }
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Redacts PII from message bodies before they reach the miner.
#[derive(Debug, Clone)]
pub struct Masker {
    classes: Vec<PiiClass>,
}

impl Masker {
    pub fn new(config: &MaskerConfig) -> Self {
        let classes = PiiClass::ORDER
            .into_iter()
            .filter(|class| match class {
                PiiClass::Email => config.email,
                PiiClass::CreditCard => config.credit_card,
                PiiClass::Ssn => config.ssn,
                PiiClass::Ipv4 => config.ipv4,
            })
            .collect();
        Self { classes }
    }

    /// Mask every enabled class, repeating until the text stops changing.
    ///
    /// Each effective replacement removes an `@` or digits and placeholders
    /// contain neither, so the loop terminates and the result is a fixed
    /// point: masking it again is a no-op.
    pub fn mask(&self, body: &str) -> String {
        let mut current = body.to_string();
        loop {
            let next = self.mask_once(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    /// Mask every value of a structured context, keeping keys and order.
    pub fn mask_context(&self, context: &Context) -> Context {
        context
            .iter()
            .map(|(k, v)| (k.clone(), self.mask(v)))
            .collect()
    }

    fn mask_once(&self, body: &str) -> String {
        let mut out = body.to_string();
        for class in &self.classes {
            if let Cow::Owned(replaced) = class.apply(&out) {
                out = replaced;
            }
        }
        out
    }
}

impl Default for Masker {
    fn default() -> Self {
        Self::new(&MaskerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_email() {
        let m = Masker::default();
        let out = m.mask("Sending email to john.doe@example.com now");
        assert_eq!(out, "Sending email to <EMAIL> now");
    }

    #[test]
    fn test_mask_ipv4() {
        let m = Masker::default();
        assert_eq!(
            m.mask("Login failed for user=admin ip=192.168.1.5 reason=bad_password"),
            "Login failed for user=admin ip=<IP> reason=bad_password"
        );
        // Not an address: octet out of range.
        assert_eq!(m.mask("version 1.2.3.999"), "version 1.2.3.999");
    }

    #[test]
    fn test_mask_card_requires_luhn() {
        let m = Masker::default();
        assert_eq!(m.mask("card=4111 1111 1111 1111 ok"), "card=<CARD> ok");
        assert_eq!(m.mask("card=4111-1111-1111-1111"), "card=<CARD>");
        // Epoch millis: 13 digits but fails the checksum.
        assert_eq!(m.mask("ts=1707734400001"), "ts=1707734400001");
    }

    #[test]
    fn test_mask_ssn() {
        let m = Masker::default();
        assert_eq!(m.mask("ssn 123-45-6789 on file"), "ssn <SSN> on file");
        // Dates are left alone.
        assert_eq!(m.mask("on 2025-11-20"), "on 2025-11-20");
    }

    #[test]
    fn test_no_pii_is_unchanged() {
        let m = Masker::default();
        let body = "Payment processed for user_id=101 amount=50.00";
        assert_eq!(m.mask(body), body);
    }

    #[test]
    fn test_idempotent() {
        let m = Masker::default();
        let inputs = [
            "x@y.com.z@w.org",
            "mail a@b.io from 10.0.0.1 card 4111111111111111",
            "<EMAIL> <IP> <CARD> <SSN>",
            "plain text",
            "",
        ];
        for input in inputs {
            let once = m.mask(input);
            assert_eq!(m.mask(&once), once, "not idempotent for {input:?}");
            assert!(!once.contains('@'), "email survived in {once:?}");
        }
    }

    #[test]
    fn test_disabled_class_is_kept() {
        let config = MaskerConfig {
            ipv4: false,
            ..MaskerConfig::default()
        };
        let m = Masker::new(&config);
        assert_eq!(m.mask("ip=10.0.0.1 to=a@b.io"), "ip=10.0.0.1 to=<EMAIL>");
    }

    #[test]
    fn test_mask_context_values() {
        let masker = Masker::default();
        let mut context = Context::new();
        context.insert("user_email".into(), "john.doe@example.com".into());
        context.insert("client_ip".into(), "10.0.0.7".into());
        context.insert("region".into(), "eu-west-1".into());

        let masked = masker.mask_context(&context);
        let keys: Vec<&str> = masked.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["user_email", "client_ip", "region"]);
        assert_eq!(masked["user_email"], "<EMAIL>");
        assert_eq!(masked["client_ip"], "<IP>");
        assert_eq!(masked["region"], "eu-west-1");
    }

    #[test]
    fn test_luhn() {
        assert!(luhn_valid("4111111111111111"));
        assert!(luhn_valid("5500 0000 0000 0004"));
        assert!(!luhn_valid("4111111111111112"));
        assert!(!luhn_valid("123"));
    }
}
