//! 基于规则分流的 SOCKS5 代理
//!
//! 客户端以 SOCKS5 连入，按进程、目标地址、HTTP Host 规则分类后，
//! 直连目标、经上游 SOCKS5 代理链转发，或重定向到本地 HTTP 改写端点。

pub mod chain;
pub mod config;
pub mod dial;
pub mod dispatcher;
pub mod dns;
pub mod domain;
pub mod error;
pub mod hosts;
pub mod http_rule;
pub mod ip_matcher;
pub mod logger;
pub mod metrics;
pub mod program;
pub mod proxy;
pub mod redirect;
pub mod rules;
pub mod server;
pub mod socks5;

pub use chain::ProxyChain;
pub use config::Config;
pub use dispatcher::{Decision, Dispatcher};
pub use error::{DialErrorKind, ProxyError};
pub use metrics::Metrics;
pub use program::{ConnInfo, OwnerLookup, ProcfsLookup};
pub use redirect::{RedirectTable, ReverseServer};
pub use rules::{MatchReason, RuleSet};
pub use server::RouterProxy;
pub use socks5::{Address, Destination};
