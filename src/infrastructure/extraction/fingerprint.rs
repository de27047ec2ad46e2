//! Layout fingerprinting
//!
//! Produces a stable, short identifier for a page's element skeleton so
//! that unmatched layouts can be grouped and reported once per redesign
//! rather than once per page.

use std::collections::BTreeSet;

use scraper::Html;

use crate::domain::version::checksum_hex;

/// Stable 16-hex-char fingerprint of the page's structural skeleton:
/// distinct (element, first-class) pairs, order-independent.
pub fn layout_fingerprint(html: &Html) -> String {
    let mut skeleton: BTreeSet<String> = BTreeSet::new();

    for node in html.tree.nodes() {
        if let Some(element) = node.value().as_element() {
            let name = element.name();
            // Text-level elements carry no layout signal
            if matches!(name, "span" | "b" | "i" | "em" | "strong" | "br") {
                continue;
            }
            match element.classes().next() {
                Some(class) => skeleton.insert(format!("{name}.{class}")),
                None => skeleton.insert(name.to_string()),
            };
        }
    }

    let joined = skeleton.into_iter().collect::<Vec<_>>().join("|");
    checksum_hex(joined.as_bytes())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_content_changes() {
        let a = Html::parse_document("<div class=\"offer\"><a href=\"/1.html\">red apple</a></div>");
        let b = Html::parse_document("<div class=\"offer\"><a href=\"/2.html\">green pear</a></div>");
        assert_eq!(layout_fingerprint(&a), layout_fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_structure() {
        let a = Html::parse_document("<div class=\"offer\"><a>x</a></div>");
        let b = Html::parse_document("<section class=\"offer-new\"><a>x</a></section>");
        assert_ne!(layout_fingerprint(&a), layout_fingerprint(&b));
    }
}
