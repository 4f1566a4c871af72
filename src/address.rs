use std::fmt;

use serde::Serialize;

const SEGMENT_SEPARATORS: [char; 3] = [';', '/', '|'];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddressFlags {
    pub had_parentheses: bool,
    pub had_multiple_segments: bool,
    pub no_numeric_component: bool,
}

impl fmt::Display for AddressFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.had_parentheses {
            names.push("had_parentheses");
        }
        if self.had_multiple_segments {
            names.push("had_multiple_segments");
        }
        if self.no_numeric_component {
            names.push("no_numeric_component");
        }
        write!(f, "{{{}}}", names.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedAddress {
    pub canonical: String,
    pub flags: AddressFlags,
    pub original: String,
}

impl NormalizedAddress {
    pub fn is_geocodable(&self) -> bool {
        !self.canonical.is_empty()
    }

    pub fn has_house_number(&self) -> bool {
        has_digit(&self.canonical)
    }
}

pub fn normalize(raw: &str) -> NormalizedAddress {
    let collapsed = collapse_whitespace(raw);
    let (without_parens, had_parentheses) = strip_parenthesized(&collapsed);

    let segments: Vec<String> = without_parens
        .split(|ch| SEGMENT_SEPARATORS.contains(&ch))
        .map(collapse_whitespace)
        .collect();
    let had_multiple_segments = segments.iter().filter(|s| !s.is_empty()).count() > 1;

    let chosen = segments
        .iter()
        .find(|segment| has_digit(segment))
        .or_else(|| segments.first())
        .map(String::as_str)
        .unwrap_or_default();
    let canonical = chosen
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    NormalizedAddress {
        flags: AddressFlags {
            had_parentheses,
            had_multiple_segments,
            no_numeric_component: !has_digit(&canonical),
        },
        canonical,
        original: raw.to_string(),
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

// Non-nested: "(a (b) c)" loses "(a (b)" and keeps " c)".
fn strip_parenthesized(value: &str) -> (String, bool) {
    let mut output = String::with_capacity(value.len());
    let mut stripped = false;
    let mut rest = value;
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        output.push_str(&rest[..open]);
        rest = &rest[open + close + 1..];
        stripped = true;
    }
    output.push_str(rest);
    (output.trim().to_string(), stripped)
}

fn has_digit(value: &str) -> bool {
    value.chars().any(|ch| ch.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn plain_segment() -> impl Strategy<Value = String> {
        "[A-Za-zäöüß][A-Za-zäöüß .-]{0,14}"
    }

    fn numbered_segment() -> impl Strategy<Value = String> {
        "[A-Z][a-zäöüß]{1,10}(str\\.|weg|allee)? [0-9]{1,3}[a-c]?"
    }

    // digits, separators and commas inside must not leak out
    fn noise() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "\\([A-Za-z0-9 ;/|,.]{0,10}\\)".prop_map(|n| format!(" {n} ")),
        ]
    }

    fn separator() -> impl Strategy<Value = char> {
        prop_oneof![Just(';'), Just('/'), Just('|')]
    }

    fn join(segments: &[(String, String)], separators: &[char]) -> String {
        let mut raw = String::new();
        for (index, (segment, noise)) in segments.iter().enumerate() {
            if index > 0 {
                raw.push(separators[index % separators.len()]);
            }
            raw.push_str(segment);
            raw.push_str(noise);
        }
        raw
    }

    fn mixed_field() -> impl Strategy<Value = String> {
        (
            prop::collection::vec(
                (prop_oneof![plain_segment(), numbered_segment()], noise()),
                1..5,
            ),
            prop::collection::vec(separator(), 1..4),
        )
            .prop_map(|(segments, separators)| join(&segments, &separators))
    }

    fn single_numbered_field() -> impl Strategy<Value = (String, String)> {
        (
            prop::collection::vec((plain_segment(), noise()), 0..3),
            (numbered_segment(), noise()),
            prop::collection::vec((plain_segment(), noise()), 0..3),
            prop::collection::vec(separator(), 1..4),
        )
            .prop_map(|(before, numbered, after, separators)| {
                let expected = numbered.0.clone();
                let mut segments = before;
                segments.push(numbered);
                segments.extend(after);
                (join(&segments, &separators), expected)
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn balanced_parentheses_never_survive(raw in mixed_field()) {
            let canonical = normalize(&raw).canonical;
            prop_assert!(!canonical.contains('('), "{raw:?} -> {canonical:?}");
            prop_assert!(!canonical.contains(')'), "{raw:?} -> {canonical:?}");
        }

        #[test]
        fn lone_numbered_alternative_is_chosen((raw, expected) in single_numbered_field()) {
            let normalized = normalize(&raw);
            prop_assert_eq!(&normalized.canonical, &expected, "from {:?}", raw);
            prop_assert!(normalized.has_house_number());
        }

        #[test]
        fn normalizing_twice_changes_nothing(raw in prop_oneof![mixed_field(), "\\PC{0,40}"]) {
            let once = normalize(&raw).canonical;
            prop_assert_eq!(normalize(&once).canonical, once);
        }
    }

    #[test]
    fn strips_parentheses_and_picks_first_numbered_segment() {
        let normalized = normalize("Hauptstr. 5 (Hinterhaus)/Nebenstr. 7");
        assert_eq!(normalized.canonical, "Hauptstr. 5");
        assert!(normalized.flags.had_parentheses);
        assert!(normalized.flags.had_multiple_segments);
        assert!(!normalized.flags.no_numeric_component);
        assert_eq!(normalized.original, "Hauptstr. 5 (Hinterhaus)/Nebenstr. 7");
    }

    #[test]
    fn prefers_segment_with_house_number() {
        assert_eq!(normalize("Hinterhof; Pallasstr. 25 | Ecke").canonical, "Pallasstr. 25");
        assert_eq!(normalize("Am Park / Kirchweg").canonical, "Am Park");
    }

    #[test]
    fn never_leaves_parenthesized_content() {
        for raw in [
            "(Seitenflügel) Oranienstr. 12",
            "Oranienstr. (a) 12 (b)",
            "Str. 1 (x)(y)",
        ] {
            let canonical = normalize(raw).canonical;
            assert!(!canonical.contains('('), "{raw} -> {canonical}");
            assert!(!canonical.contains(')'), "{raw} -> {canonical}");
        }
    }

    #[test]
    fn cuts_after_first_comma_and_collapses_whitespace() {
        let normalized = normalize("  Kastanienallee   3 ,  Berlin-Mitte ");
        assert_eq!(normalized.canonical, "Kastanienallee 3");
        assert!(!normalized.flags.had_multiple_segments);
    }

    #[test]
    fn empty_and_numberless_inputs() {
        let empty = normalize("   ");
        assert_eq!(empty.canonical, "");
        assert!(!empty.is_geocodable());
        assert!(empty.flags.no_numeric_component);

        let numberless = normalize("Tempelhofer Feld");
        assert!(numberless.is_geocodable());
        assert!(!numberless.has_house_number());
    }

    #[test]
    fn normalizing_canonical_output_is_idempotent() {
        for raw in [
            "Hauptstr. 5 (Hinterhaus)/Nebenstr. 7",
            "Str (5",
            "a) 5; b 6",
            "Weg 1, Hof",
            "",
        ] {
            let once = normalize(raw).canonical;
            assert_eq!(normalize(&once).canonical, once);
        }
    }

    #[test]
    fn flags_render_as_set() {
        let flags = normalize("Weg (x)/Pfad").flags;
        assert_eq!(
            flags.to_string(),
            "{had_parentheses, had_multiple_segments, no_numeric_component}"
        );
    }
}
