//! Text-level cleanup of generated HTML before it is pushed to the wiki.
//!
//! Full normalization to XHTML stays the job of an external tidy collaborator;
//! this module carries the interface plus the ad-hoc stripping the add-in does
//! itself: Word artifact removal, tag-span deletion, body-tag replacement, and
//! indent-only reformatting.

/// Which cleanup profile to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanMode {
    /// Generic cleanup: XML declarations and HTML comments go.
    General,
    /// Word-origin cleanup: additionally drops conditional comments, inline
    /// style blocks, and Office-namespace tag markup.
    WordOrigin,
}

const OFFICE_NAMESPACES: [&str; 3] = ["o:", "w:", "v:"];

const VOID_TAGS: [&str; 13] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

pub fn clean_html(html: &str, mode: CleanMode) -> String {
    let mut content = html.to_string();
    if mode == CleanMode::WordOrigin {
        content = remove_tag_span(&content, "<!--[if", "<![endif]-->");
        content = remove_tag_span(&content, "<style", "</style>");
        content = strip_office_tags(&content);
    }
    content = remove_tag_span(&content, "<?xml", "?>");
    content = remove_tag_span(&content, "<!--", "-->");
    content
}

/// Repeatedly removes the first span delimited by the markers, inclusive,
/// until no complete pair remains. An unmatched start marker is left in
/// place.
pub fn remove_tag_span(content: &str, start_marker: &str, end_marker: &str) -> String {
    let mut content = content.to_string();
    loop {
        let Some(start) = content.find(start_marker) else {
            return content;
        };
        let Some(end) = content[start + start_marker.len()..].find(end_marker) else {
            return content;
        };
        let span_end = start + start_marker.len() + end + end_marker.len();
        content.replace_range(start..span_end, "");
    }
}

/// Swaps the opening `<body ...>` tag for the given one. Input without a body
/// tag comes back unchanged.
pub fn replace_body_tag(content: &str, new_body_tag: &str) -> String {
    let Some(start) = content.find("<body") else {
        return content.to_string();
    };
    let Some(end) = content[start..].find('>') else {
        return content.to_string();
    };
    let mut output = content.to_string();
    output.replace_range(start..start + end + 1, new_body_tag);
    output
}

/// Drops Office-namespace tag markup (`<o:p>`, `</w:sdt>`, ...) while keeping
/// the text those tags wrap.
fn strip_office_tags(content: &str) -> String {
    let mut output = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find('<') {
        output.push_str(&rest[..start]);
        rest = &rest[start..];
        let name_start = if rest.starts_with("</") { 2 } else { 1 };
        let name = &rest[name_start..];
        let is_office = OFFICE_NAMESPACES.iter().any(|prefix| {
            name.get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        });
        let Some(end) = rest.find('>') else {
            output.push_str(rest);
            return output;
        };
        if !is_office {
            output.push_str(&rest[..=end]);
        }
        rest = &rest[end + 1..];
    }
    output.push_str(rest);
    output
}

/// Indent-only reformatting: one tag or text run per line, two-space depth
/// indentation, no content rewriting.
pub fn indent_content(html: &str) -> String {
    let mut output = String::new();
    let mut depth = 0usize;
    let mut rest = html;

    while !rest.is_empty() {
        let Some(start) = rest.find('<') else {
            push_line(&mut output, depth, rest);
            break;
        };
        push_line(&mut output, depth, &rest[..start]);
        rest = &rest[start..];
        let Some(end) = rest.find('>') else {
            push_line(&mut output, depth, rest);
            break;
        };
        let tag = &rest[..=end];
        if tag.starts_with("</") {
            depth = depth.saturating_sub(1);
            push_line(&mut output, depth, tag);
        } else if is_neutral_tag(tag) {
            push_line(&mut output, depth, tag);
        } else {
            push_line(&mut output, depth, tag);
            depth += 1;
        }
        rest = &rest[end + 1..];
    }
    output
}

fn push_line(output: &mut String, depth: usize, text: &str) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    for _ in 0..depth {
        output.push_str("  ");
    }
    output.push_str(trimmed);
    output.push('\n');
}

fn is_neutral_tag(tag: &str) -> bool {
    if tag.ends_with("/>") || tag.starts_with("<!") || tag.starts_with("<?") {
        return true;
    }
    let name = tag
        .trim_start_matches('<')
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    VOID_TAGS.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_tag_span_removes_every_complete_pair() {
        let cleaned = remove_tag_span("a<!--x-->b<!--y-->c", "<!--", "-->");
        assert_eq!(cleaned, "abc");
    }

    #[test]
    fn remove_tag_span_keeps_unmatched_start_marker() {
        let cleaned = remove_tag_span("a<!--x b", "<!--", "-->");
        assert_eq!(cleaned, "a<!--x b");
    }

    #[test]
    fn remove_tag_span_handles_adjacent_spans_after_removal() {
        let cleaned = remove_tag_span("<!--a<!--b-->c-->", "<!--", "-->");
        assert_eq!(cleaned, "c-->");
    }

    #[test]
    fn replace_body_tag_swaps_attributed_tag() {
        let replaced = replace_body_tag("<html><body class=\"word\"><p>x</p></body></html>", "<body>");
        assert_eq!(replaced, "<html><body><p>x</p></body></html>");
    }

    #[test]
    fn replace_body_tag_without_body_is_unchanged() {
        assert_eq!(replace_body_tag("<p>x</p>", "<body>"), "<p>x</p>");
    }

    #[test]
    fn general_clean_strips_declarations_and_comments() {
        let cleaned = clean_html(
            "<?xml version=\"1.0\"?><p>keep<!-- drop --></p>",
            CleanMode::General,
        );
        assert_eq!(cleaned, "<p>keep</p>");
    }

    #[test]
    fn word_clean_strips_conditional_comments_and_office_tags() {
        let source = "<!--[if gte mso 9]><xml>junk</xml><![endif]-->\
                      <p><o:p>hello</o:p> world</p>";
        let cleaned = clean_html(source, CleanMode::WordOrigin);
        assert_eq!(cleaned, "<p>hello world</p>");
    }

    #[test]
    fn word_clean_strips_office_tags_case_insensitively() {
        let cleaned = clean_html("<p><O:P>hello</o:P> <W:Sdt>there</w:sdt></p>", CleanMode::WordOrigin);
        assert_eq!(cleaned, "<p>hello there</p>");
    }

    #[test]
    fn word_clean_strips_style_blocks() {
        let cleaned = clean_html(
            "<style>p { mso-style: x; }</style><p>text</p>",
            CleanMode::WordOrigin,
        );
        assert_eq!(cleaned, "<p>text</p>");
    }

    #[test]
    fn general_clean_keeps_office_tags() {
        let cleaned = clean_html("<p><o:p>x</o:p></p>", CleanMode::General);
        assert_eq!(cleaned, "<p><o:p>x</o:p></p>");
    }

    #[test]
    fn indent_content_nests_by_depth() {
        let indented = indent_content("<div><p>hi</p><br/></div>");
        assert_eq!(indented, "<div>\n  <p>\n    hi\n  </p>\n  <br/>\n</div>\n");
    }

    #[test]
    fn indent_content_treats_void_tags_as_neutral() {
        let indented = indent_content("<p>a<br>b</p>");
        assert_eq!(indented, "<p>\n  a\n  <br>\n  b\n</p>\n");
    }
}
