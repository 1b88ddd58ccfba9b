//! Terminal markup translation.
//!
//! Answers may carry a tiny tag vocabulary (`<red>`, `<bold>`, ...) and the
//! `\e[<n>m` shorthand. Both are rewritten into ANSI escape sequences; any
//! other text, including broken tags, is left alone.

use regex::Regex;
use std::sync::LazyLock;

const RESET: &str = "\x1b[0m";

/// Fixed tag table. No tag is a substring of another, so order is irrelevant.
const TAGS: [(&str, &str); 10] = [
    ("<red>", "\x1b[31m"),
    ("</red>", RESET),
    ("<green>", "\x1b[32m"),
    ("</green>", RESET),
    ("<blue>", "\x1b[34m"),
    ("</blue>", RESET),
    ("<bold>", "\x1b[1m"),
    ("</bold>", RESET),
    ("<yellow>", "\x1b[33m"),
    ("</yellow>", RESET),
];

static ESCAPE_SHORTHAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\e\[(\d+)m").expect("escape shorthand pattern is valid"));

/// Instructions appended to the system prompt so the model knows which tags
/// it may use.
pub const MARKUP_HINT: &str = "使用以下格式添加颜色和样式：<red>红色文本</red>、<green>绿色文本</green>、<blue>蓝色文本</blue>、<bold>粗体文本</bold>、<yellow>黄色文本</yellow>。重要内容请使用颜色或粗体突出显示。";

/// Render markup tags and escape shorthand as ANSI escape sequences.
pub fn render(text: &str) -> String {
    let mut result = text.to_string();
    for (tag, ansi) in TAGS {
        if result.contains(tag) {
            result = result.replace(tag, ansi);
        }
    }

    // `${1}` rather than `$1m`, which would name a group called "1m"
    ESCAPE_SHORTHAND
        .replace_all(&result, "\x1b[${1}m")
        .into_owned()
}
