use log::info;

/// 关键字匹配器：目标字符串包含任一关键字即命中（子串匹配，不是精确匹配）
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
    /// 按配置顺序保存，先出现的关键字优先
    keywords: Vec<String>,
    /// 是否忽略大小写（域名类规则）
    ignore_case: bool,
}

impl KeywordMatcher {
    /// 创建区分大小写的匹配器（用于进程命令行）
    pub fn new(keywords: Vec<String>) -> Self {
        Self::build(keywords, false)
    }

    /// 创建忽略大小写的匹配器（用于域名 / Host 头）
    pub fn hostnames(keywords: Vec<String>) -> Self {
        Self::build(keywords, true)
    }

    fn build(keywords: Vec<String>, ignore_case: bool) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(keywords.len());

        for keyword in keywords {
            let keyword = keyword.trim();
            if keyword.is_empty() {
                continue;
            }
            let keyword = if ignore_case {
                keyword.to_ascii_lowercase()
            } else {
                keyword.to_string()
            };
            if !unique.contains(&keyword) {
                info!("添加关键字规则: {}", keyword);
                unique.push(keyword);
            }
        }

        Self {
            keywords: unique,
            ignore_case,
        }
    }

    /// 返回第一个被包含的关键字
    #[inline]
    pub fn matches(&self, text: &str) -> Option<&str> {
        if self.keywords.is_empty() {
            return None;
        }

        let lowered;
        let haystack = if self.ignore_case {
            lowered = text.to_ascii_lowercase();
            lowered.as_str()
        } else {
            text
        };

        self.keywords
            .iter()
            .find(|k| haystack.contains(k.as_str()))
            .map(String::as_str)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_not_exact() {
        let matcher = KeywordMatcher::hostnames(vec!["example.com".to_string()]);

        assert_eq!(matcher.matches("www.example.com.evil.test"), Some("example.com"));
        assert_eq!(matcher.matches("example.com"), Some("example.com"));
        assert_eq!(matcher.matches("example.org"), None);
    }

    #[test]
    fn test_hostnames_case_insensitive() {
        let matcher = KeywordMatcher::hostnames(vec!["GitHub".to_string()]);

        assert_eq!(matcher.matches("api.github.com"), Some("github"));
        assert_eq!(matcher.matches("API.GITHUB.COM"), Some("github"));
    }

    #[test]
    fn test_only_ascii_is_folded() {
        let matcher = KeywordMatcher::hostnames(vec!["MÜNCHEN".to_string()]);

        assert_eq!(matcher.matches("www.mÜnchen.de"), Some("mÜnchen"));
        assert_eq!(matcher.matches("www.münchen.de"), None);
    }

    #[test]
    fn test_programs_case_sensitive() {
        let matcher = KeywordMatcher::new(vec!["firefox".to_string()]);

        assert_eq!(matcher.matches("/usr/lib/firefox/firefox -P"), Some("firefox"));
        assert_eq!(matcher.matches("/opt/Firefox"), None);
    }

    #[test]
    fn test_config_order_wins() {
        let matcher = KeywordMatcher::hostnames(vec![
            "google".to_string(),
            "mail.google".to_string(),
        ]);
        assert_eq!(matcher.matches("mail.google.com"), Some("google"));
    }

    #[test]
    fn test_empty_and_blank() {
        let matcher = KeywordMatcher::new(vec!["".to_string(), "  ".to_string()]);
        assert!(matcher.is_empty());
        assert_eq!(matcher.matches("anything"), None);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let matcher = KeywordMatcher::hostnames(vec![
            "Example.com".to_string(),
            "example.COM".to_string(),
        ]);
        assert_eq!(matcher.len(), 1);
    }
}
