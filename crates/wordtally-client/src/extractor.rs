use scraper::{Html, Node};
use wordtally_core::traits::TokenExtractor;

/// Elements whose text never reaches the reader.
const SKIPPED_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];

/// Lowercase `raw` and drop every non-letter character.
pub fn normalize_word(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split text on whitespace and normalize each piece, dropping empties.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(normalize_word)
        .filter(|word| !word.is_empty())
}

/// Token extractor for HTML documents.
///
/// Walks every text node of the parsed document except those inside
/// `script`, `style`, or `noscript`. Plain text is parsed as a document
/// with a single text node, so it tokenizes the same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlTokenExtractor;

impl HtmlTokenExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl TokenExtractor for HtmlTokenExtractor {
    fn extract(&self, content: &[u8]) -> Vec<String> {
        let html = String::from_utf8_lossy(content);
        let document = Html::parse_document(&html);

        let mut tokens = Vec::new();
        for node in document.tree.root().descendants() {
            let Node::Text(text) = node.value() else {
                continue;
            };
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()))
            });
            if !hidden {
                tokens.extend(tokenize(text));
            }
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_word() {
        assert_eq!(normalize_word("Hello,"), "hello");
        assert_eq!(normalize_word("don't"), "dont");
        assert_eq!(normalize_word("C3PO"), "cpo");
        assert_eq!(normalize_word("ÉCOLE"), "école");
        assert_eq!(normalize_word("42"), "");
    }

    #[test]
    fn test_extracts_visible_text_in_order() {
        let html = br#"<html>
            <head><title>Daily News</title><style>body { color: red; }</style></head>
            <body>
                <h1>Breaking: Tests pass!</h1>
                <script>var hidden = "secret words";</script>
                <p>The <b>quick</b> brown fox.</p>
                <noscript>enable javascript</noscript>
            </body>
        </html>"#;

        let tokens = HtmlTokenExtractor.extract(html);
        assert_eq!(
            tokens,
            vec!["daily", "news", "breaking", "tests", "pass", "the", "quick", "brown", "fox"]
        );
    }

    #[test]
    fn test_plain_text_is_tokenized() {
        let tokens = HtmlTokenExtractor.extract(b"This is a test. Test again!");
        assert_eq!(tokens, vec!["this", "is", "a", "test", "test", "again"]);
    }

    #[test]
    fn test_invalid_utf8_does_not_panic() {
        let tokens = HtmlTokenExtractor.extract(&[0x66, 0x6f, 0x78, 0xff, 0x20, 0x64, 0x6f, 0x67]);
        assert_eq!(tokens, vec!["fox", "dog"]);
    }

    #[test]
    fn test_empty_document() {
        assert!(HtmlTokenExtractor.extract(b"").is_empty());
        assert!(HtmlTokenExtractor.extract(b"<html><body></body></html>").is_empty());
    }
}
