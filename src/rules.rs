use log::info;
use std::fmt;

use crate::domain::KeywordMatcher;
use crate::http_rule::HttpHostMatcher;
use crate::ip_matcher::{CidrMatcher, Network};
use crate::socks5::{Address, Destination};

/// 命中的规则，用于路由日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchReason {
    Program(String),
    Keyword(String),
    Cidr(String),
    HttpHost(String),
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::Program(k) => write!(f, "match ProgramKeyword: {}", k),
            MatchReason::Keyword(k) => write!(f, "match HostnameKeyword: {}", k),
            MatchReason::Cidr(c) => write!(f, "match CIDR: {}", c),
            MatchReason::HttpHost(k) => write!(f, "match HttpKeyword: {}", k),
        }
    }
}

/// 启动时加载的规则快照，加载后只读，可被所有连接并发读取
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    address_on: bool,
    program_on: bool,
    http_on: bool,
    cidrs: CidrMatcher,
    keywords: KeywordMatcher,
    programs: KeywordMatcher,
    http_hosts: HttpHostMatcher,
}

impl RuleSet {
    /// 空规则集：所有分类器关闭
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::default()
    }

    /// 按目标地址匹配：域名走关键字，IP 走 CIDR
    pub fn match_address(&self, dest: &Destination) -> Option<MatchReason> {
        if !self.address_on {
            return None;
        }
        match &dest.address {
            Address::Domain(host) => self
                .keywords
                .matches(host)
                .map(|k| MatchReason::Keyword(k.to_string())),
            other => other
                .ip()
                .and_then(|ip| self.cidrs.matches(ip))
                .map(MatchReason::Cidr),
        }
    }

    /// 按进程命令行匹配
    pub fn match_program(&self, cmdline: &str) -> Option<MatchReason> {
        if !self.program_active() {
            return None;
        }
        self.programs
            .matches(cmdline)
            .map(|k| MatchReason::Program(k.to_string()))
    }

    /// 按预读的 HTTP 载荷匹配 Host 头
    pub fn match_http(&self, payload: &[u8]) -> Option<MatchReason> {
        if !self.http_active() {
            return None;
        }
        self.http_hosts
            .match_payload(payload)
            .map(MatchReason::HttpHost)
    }

    /// 进程规则是否需要查询连接所属进程
    pub fn program_active(&self) -> bool {
        self.program_on && !self.programs.is_empty()
    }

    /// HTTP 规则是否需要预读客户端载荷
    pub fn http_active(&self) -> bool {
        self.http_on && !self.http_hosts.is_empty()
    }
}

/// 规则集构建器
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    address_on: bool,
    program_on: bool,
    http_on: bool,
    address_entries: Vec<String>,
    programs: Vec<String>,
    http_hosts: Vec<String>,
}

impl RuleSetBuilder {
    /// 地址规则：CIDR / IP 进入网段表，其余作为域名关键字
    pub fn address(mut self, enabled: bool, entries: Vec<String>) -> Self {
        self.address_on = enabled;
        self.address_entries = entries;
        self
    }

    pub fn program(mut self, enabled: bool, entries: Vec<String>) -> Self {
        self.program_on = enabled;
        self.programs = entries;
        self
    }

    pub fn http(mut self, enabled: bool, entries: Vec<String>) -> Self {
        self.http_on = enabled;
        self.http_hosts = entries;
        self
    }

    pub fn build(self) -> RuleSet {
        let mut cidrs = CidrMatcher::default();
        let mut keywords = Vec::new();

        for entry in self.address_entries {
            match Network::parse(&entry) {
                Some(network) => cidrs.push(network),
                None => keywords.push(entry),
            }
        }

        let rules = RuleSet {
            address_on: self.address_on,
            program_on: self.program_on,
            http_on: self.http_on,
            cidrs,
            keywords: KeywordMatcher::hostnames(keywords),
            programs: KeywordMatcher::new(self.programs),
            http_hosts: HttpHostMatcher::new(self.http_hosts),
        };

        info!(
            "规则加载完成: 地址规则 {} ({} 个网段, {} 个关键字), 进程规则 {} ({} 条), HTTP 规则 {}",
            on_off(rules.address_on),
            rules.cidrs.len(),
            rules.keywords.len(),
            on_off(rules.program_on),
            rules.programs.len(),
            on_off(rules.http_on)
        );
        rules
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}
