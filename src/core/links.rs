use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

lazy_static! {
    // [[target]] or [[target|display]]
    static ref WIKILINK_RE: Regex = Regex::new(r"\[\[([^\]|]+)(?:\|[^\]]+)?\]\]").unwrap();
    // [text](./target.md#anchor)
    static ref MARKDOWN_LINK_RE: Regex = Regex::new(r"\[.+?\]\(\.?/?(.*?)\)").unwrap();
}

pub fn extract_wikilinks(content: &str) -> Vec<String> {
    WIKILINK_RE
        .captures_iter(content)
        .map(|c| c[1].trim().to_string())
        .collect()
}

/// Basenames of markdown files referenced by `[text](target.md)` links
pub fn extract_markdown_file_links(content: &str) -> Vec<String> {
    MARKDOWN_LINK_RE
        .captures_iter(content)
        .filter_map(|c| {
            let target = c[1].split('#').next().unwrap_or("").trim();
            if !target.to_ascii_lowercase().ends_with(".md") {
                return None;
            }
            target
                .rsplit(['/', '\\'])
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect()
}

/// Outbound document links of `content`, normalised to file names.
///
/// Wikilinks without an extension are assumed to point at markdown files.
pub fn detect_outbound_links(content: &str) -> BTreeSet<String> {
    let mut links: BTreeSet<String> = extract_markdown_file_links(content).into_iter().collect();
    for target in extract_wikilinks(content) {
        let name = target.split('#').next().unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        let name = name.rsplit('/').next().unwrap_or(name);
        if name.contains('.') {
            links.insert(name.to_string());
        } else {
            links.insert(format!("{}.md", name));
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wikilinks() {
        let links = extract_wikilinks("See [[GPU Guide]] and [[cuda|CUDA basics]].");
        assert_eq!(links, vec!["GPU Guide", "cuda"]);
    }

    #[test]
    fn test_markdown_file_links() {
        let content = "[one](./posts/one.md#intro) [two](two.md) [site](https://example.com) [img](a.png)";
        assert_eq!(extract_markdown_file_links(content), vec!["one.md", "two.md"]);
    }

    #[test]
    fn test_detect_outbound_links_merges_both_styles() {
        let content = "[x](x.md)\n* [[y|Why]]\n* [[notes/z.md]]";
        let links: Vec<String> = detect_outbound_links(content).into_iter().collect();
        assert_eq!(links, vec!["x.md", "y.md", "z.md"]);
    }

    #[test]
    fn test_no_links() {
        assert!(detect_outbound_links("plain [brackets] and (parens)").is_empty());
    }
}
