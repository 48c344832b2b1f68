//! 快速通道：固定词表的确定性命令（不调用 LLM），以及机器人名前缀剥离

/// 快速通道命令（输入 trim + 小写后精确匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathCommand {
    Status,
    Greeting,
    HealthTests,
}

impl FastPathCommand {
    pub fn classify(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "status" | "health" | "are you working" => Some(FastPathCommand::Status),
            "hello" | "hi" => Some(FastPathCommand::Greeting),
            "run health tests" | "health tests" | "run tests" => Some(FastPathCommand::HealthTests),
            _ => None,
        }
    }
}

/// 去掉开头的机器人名（不区分大小写，可跟 `:` 或 `,`），返回 trim 后的剩余部分。
/// 名字后必须是结尾、空白或标点，避免把 "socbotics" 当成 "socbot"
pub fn strip_bot_prefix<'a>(input: &'a str, bot_names: &[String]) -> &'a str {
    let trimmed = input.trim();

    let mut names: Vec<&str> = bot_names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));

    for name in names {
        let Some(head) = trimmed.get(..name.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(name) {
            continue;
        }
        let rest = &trimmed[name.len()..];
        match rest.chars().next() {
            None => return "",
            Some(c) if c.is_whitespace() || c == ':' || c == ',' => {
                return rest.trim_start_matches(|c: char| c == ':' || c == ',').trim();
            }
            Some(_) => continue,
        }
    }
    trimmed
}
