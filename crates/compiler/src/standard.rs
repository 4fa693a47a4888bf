//! C standard registry and feature gating
//!
//! Every dialect the compiler accepts is enumerated here together with the
//! set of language features it enables. The lexer consults this table to
//! decide whether a spelling is a keyword; the analyzer consults it for
//! construct-level gating (`for`-declarations, `_Static_assert`, ...).
//!
//! Gating policy for out-of-standard spellings:
//! - Plain words (`inline`, `restrict`, `true`) degrade to ordinary
//!   identifiers with a warning, because a conforming C89 program may use
//!   them as names.
//! - Reserved spellings (`_Bool`, `_Static_assert`, anything in the `_Foo`
//!   namespace) are always recognized as keywords so later phases can give
//!   a precise "requires C11" style error instead of a parse error.

use std::fmt;

/// A recognized C language standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Standard {
    C89,
    C90,
    C99,
    C11,
    C23,
    Gnu89,
    Gnu99,
}

impl Standard {
    /// Parse a `-std=` argument value.
    pub fn from_tag(tag: &str) -> Option<Standard> {
        match tag {
            "c89" => Some(Standard::C89),
            "c90" => Some(Standard::C90),
            "c99" => Some(Standard::C99),
            "c11" => Some(Standard::C11),
            "c23" => Some(Standard::C23),
            "gnu89" => Some(Standard::Gnu89),
            "gnu99" => Some(Standard::Gnu99),
            _ => None,
        }
    }

    /// The ISO standard this dialect is based on, with GNU dialects mapped
    /// to their base standard.
    pub fn base(self) -> Standard {
        match self {
            Standard::Gnu89 => Standard::C89,
            Standard::Gnu99 => Standard::C99,
            other => other,
        }
    }

    /// True for the GNU dialects.
    pub fn is_gnu(self) -> bool {
        matches!(self, Standard::Gnu89 | Standard::Gnu99)
    }

    /// Ordering rank used for "at least C99" style checks.
    /// C89 and C90 are the same language; GNU dialects rank as their base.
    fn rank(self) -> u32 {
        match self.base() {
            Standard::C89 | Standard::C90 => 89,
            Standard::C99 => 99,
            Standard::C11 => 111,
            Standard::C23 => 123,
            _ => unreachable!("base() returns ISO standards only"),
        }
    }

    /// True when this dialect is `other` or newer (GNU maps to its base).
    pub fn at_least(self, other: Standard) -> bool {
        self.rank() >= other.rank()
    }

    /// Value of `__STDC_VERSION__` for this dialect, if it defines one.
    pub fn stdc_version(self) -> Option<i64> {
        match self.base() {
            Standard::C89 | Standard::C90 => None,
            Standard::C99 => Some(199901),
            Standard::C11 => Some(201112),
            Standard::C23 => Some(202311),
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for Standard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Standard::C89 => "c89",
            Standard::C90 => "c90",
            Standard::C99 => "c99",
            Standard::C11 => "c11",
            Standard::C23 => "c23",
            Standard::Gnu89 => "gnu89",
            Standard::Gnu99 => "gnu99",
        };
        write!(f, "{}", tag)
    }
}

/// Closed set of gated language features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Inline,
    Restrict,
    Bool,
    LongLong,
    StaticAssert,
    Atomic,
    Generic,
    Noreturn,
    Nullptr,
    Constexpr,
    Typeof,
    Alignas,
    Alignof,
    AnonymousStruct,
    Vla,
    DesignatedInit,
    CompoundLiteral,
    FlexibleArray,
    ForDecl,
    FuncName,
    TrueFalse,
    LineComment,
    ImplicitInt,
    ImplicitFunctionDecl,
}

/// Query whether `std` enables `feat`.
pub fn has_feature(std: Standard, feat: Feature) -> bool {
    use Feature::*;
    match feat {
        // C99 additions (also available in GNU89 as extensions).
        Inline | Restrict | Bool | LongLong | Vla | DesignatedInit | CompoundLiteral
        | FlexibleArray | ForDecl | FuncName | LineComment => {
            std.at_least(Standard::C99) || std.is_gnu()
        }
        AnonymousStruct => std.at_least(Standard::C11) || std.is_gnu(),
        // C11 additions.
        StaticAssert | Atomic | Generic | Noreturn | Alignas | Alignof => {
            std.at_least(Standard::C11)
        }
        // C23 additions.
        Nullptr | Constexpr | TrueFalse => std.at_least(Standard::C23),
        // GNU extension only; standardized in C23.
        Typeof => std.is_gnu() || std.at_least(Standard::C23),
        // Pre-C99 permissiveness, withdrawn later.
        ImplicitInt | ImplicitFunctionDecl => !std.at_least(Standard::C99),
    }
}

/// How an out-of-standard keyword spelling should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordPolicy {
    /// Lex as a keyword; the construct is available.
    Keyword,
    /// Lex as an identifier and warn (plain-word spelling, conforming
    /// programs may use it as a name).
    IdentifierWithWarning,
    /// Lex as a keyword anyway (reserved `_Foo` spelling) so the parser can
    /// report a precise standard-conformance error.
    KeywordWithDeferredError,
}

/// Decide how a gated keyword spelling behaves under `std`.
///
/// `spelling` is the keyword text; `feat` is the feature that guards it.
pub fn keyword_policy(std: Standard, spelling: &str, feat: Feature) -> KeywordPolicy {
    if has_feature(std, feat) {
        return KeywordPolicy::Keyword;
    }
    if is_reserved_spelling(spelling) {
        KeywordPolicy::KeywordWithDeferredError
    } else {
        KeywordPolicy::IdentifierWithWarning
    }
}

/// Spellings in the implementation-reserved namespace: an underscore
/// followed by an uppercase letter or another underscore.
pub fn is_reserved_spelling(spelling: &str) -> bool {
    let mut chars = spelling.chars();
    match (chars.next(), chars.next()) {
        (Some('_'), Some(c)) => c.is_ascii_uppercase() || c == '_',
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_tags_round_trip() {
        for tag in ["c89", "c90", "c99", "c11", "c23", "gnu89", "gnu99"] {
            let std = Standard::from_tag(tag).unwrap();
            assert_eq!(std.to_string(), tag);
        }
        assert!(Standard::from_tag("c17").is_none());
    }

    #[test]
    fn test_gnu89_enables_c99_conveniences() {
        assert!(has_feature(Standard::Gnu89, Feature::Inline));
        assert!(has_feature(Standard::Gnu89, Feature::LongLong));
        assert!(!has_feature(Standard::C89, Feature::Inline));
    }

    #[test]
    fn test_c11_gates() {
        assert!(has_feature(Standard::C11, Feature::StaticAssert));
        assert!(!has_feature(Standard::C99, Feature::StaticAssert));
        assert!(!has_feature(Standard::Gnu99, Feature::Generic));
    }

    #[test]
    fn test_implicit_int_withdrawn_in_c99() {
        assert!(has_feature(Standard::C89, Feature::ImplicitInt));
        assert!(has_feature(Standard::Gnu89, Feature::ImplicitFunctionDecl));
        assert!(!has_feature(Standard::C99, Feature::ImplicitInt));
    }

    #[test]
    fn test_keyword_policy_split() {
        // Plain word out of standard: degrade to identifier.
        assert_eq!(
            keyword_policy(Standard::C89, "inline", Feature::Inline),
            KeywordPolicy::IdentifierWithWarning
        );
        // Reserved spelling out of standard: keep the keyword.
        assert_eq!(
            keyword_policy(Standard::C89, "_Static_assert", Feature::StaticAssert),
            KeywordPolicy::KeywordWithDeferredError
        );
        assert_eq!(
            keyword_policy(Standard::C11, "_Static_assert", Feature::StaticAssert),
            KeywordPolicy::Keyword
        );
    }

    #[test]
    fn test_reserved_spelling() {
        assert!(is_reserved_spelling("_Bool"));
        assert!(is_reserved_spelling("__func__"));
        assert!(!is_reserved_spelling("inline"));
        assert!(!is_reserved_spelling("_x"));
    }
}
