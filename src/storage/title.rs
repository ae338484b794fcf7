//! 根据第一条用户消息生成会话标题

/// 过短的标题使用此前缀
pub const TITLE_PREFIX: &str = "Conversation: ";

/// 默认的标题最大长度（字符数）
pub const DEFAULT_TITLE_LENGTH: usize = 50;

const ELLIPSIS: &str = "...";
const MIN_TITLE_CHARS: usize = 10;

/// 生成会话标题
/// - 去除首尾空白；
/// - 若包含问号，截断到第一个问号（含）；
/// - 超过`max_length`个字符时截断，并以省略号结尾，总长度恰为`max_length`；
/// - 不足10个字符时添加前缀。
pub fn generate_title(first_message: &str, max_length: usize) -> String {
    let mut title = first_message.trim().to_string();

    // 如果是问句，使用问句作为标题
    if let Some(pos) = title.find('?') {
        title.truncate(pos + 1);
    }

    if title.chars().count() > max_length {
        title = match max_length.checked_sub(ELLIPSIS.len()) {
            Some(keep) => title.chars().take(keep).chain(ELLIPSIS.chars()).collect(),
            None => title.chars().take(max_length).collect(),
        };
    }

    if title.chars().count() < MIN_TITLE_CHARS {
        title = format!("{TITLE_PREFIX}{title}");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_is_kept() {
        assert_eq!(
            generate_title("What is the capital of France? Thanks", 50),
            "What is the capital of France?"
        );
    }

    #[test]
    fn test_short_message_gets_prefix() {
        let title = generate_title("Hi", 50);
        assert!(title.starts_with(TITLE_PREFIX));
        assert!(title.contains("Hi"));
        assert_eq!(generate_title("   ", 50), TITLE_PREFIX);
    }

    #[test]
    fn test_long_message_is_cut() {
        let title = generate_title(&"x".repeat(80), 50);
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
        assert_eq!(title, format!("{}...", "x".repeat(47)));
    }

    #[test]
    fn test_exact_length_is_not_cut() {
        let message = "y".repeat(50);
        assert_eq!(generate_title(&message, 50), message);
    }

    #[test]
    fn test_multibyte_characters() {
        let title = generate_title(&"żółw ".repeat(20), 20);
        assert_eq!(title.chars().count(), 20);
        assert!(title.starts_with("żółw"));
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_question_then_cut() {
        let question = format!("{}? and more", "q".repeat(70));
        let title = generate_title(&question, 50);
        assert_eq!(title.chars().count(), 50);
        assert!(!title.contains("more"));
    }

    #[test]
    fn test_tiny_max_length() {
        assert_eq!(generate_title("abcdefghijkl", 2), format!("{TITLE_PREFIX}ab"));
    }
}
