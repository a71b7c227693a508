//! 代理列表加载
//!
//! 支持 `{"configs": [...]}` 和裸 JSON 数组两种格式；内容不是 JSON 时
//! 按 base64 解码后再解析（自动识别 URL-safe 字母表和是否带填充）。

use super::types::RawProxy;
use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProxyListFile {
    Wrapped { configs: Vec<RawProxy> },
    Bare(Vec<RawProxy>),
}

/// 从文件加载代理列表
pub fn load_proxy_list<P: AsRef<Path>>(path: P, limit: Option<usize>) -> Result<Vec<RawProxy>> {
    let content = fs::read_to_string(path.as_ref())?;
    let raws = parse_proxy_list(&content)?;
    Ok(normalize(raws, limit))
}

/// 解析代理列表内容（JSON 或 base64 编码的 JSON）
pub fn parse_proxy_list(content: &str) -> Result<Vec<RawProxy>> {
    let trimmed = content.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return parse_json(trimmed);
    }

    debug!("proxy list is not plain JSON, trying base64");
    let decoded = auto_decode(trimmed)?;
    let text = String::from_utf8(decoded)
        .map_err(|e| Error::ProxyList(format!("decoded content is not utf-8: {e}")))?;
    parse_json(text.trim())
}

fn parse_json(content: &str) -> Result<Vec<RawProxy>> {
    let file: ProxyListFile = serde_json::from_str(content)?;
    Ok(match file {
        ProxyListFile::Wrapped { configs } => configs,
        ProxyListFile::Bare(configs) => configs,
    })
}

/// 根据字符集和结尾的 `=` 选择 base64 变体
pub fn auto_decode(input: &str) -> Result<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let url_safe = compact.contains(['-', '_']);
    let padded = compact.ends_with('=');

    let engine = match (url_safe, padded) {
        (true, true) => &URL_SAFE,
        (true, false) => &URL_SAFE_NO_PAD,
        (false, true) => &STANDARD,
        (false, false) => &STANDARD_NO_PAD,
    };

    engine
        .decode(compact.as_bytes())
        .map_err(|e| Error::ProxyList(format!("invalid base64: {e}")))
}

/// 过滤无效记录、清理名称并保证名称唯一
pub fn normalize(raws: Vec<RawProxy>, limit: Option<usize>) -> Vec<RawProxy> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut emitted: HashSet<String> = HashSet::new();
    let mut result = Vec::new();

    for mut raw in raws {
        if result.len() >= limit {
            break;
        }

        if !raw.has_valid_endpoint() {
            warn!(
                "skipping invalid proxy '{}': server={:?} port={}",
                raw.remarks, raw.server, raw.port
            );
            continue;
        }

        let base = raw.display_name();
        let name = if emitted.contains(&base) {
            // 后缀也可能和已有名称重复，一直递增到未使用的编号
            let count = counters.entry(base.clone()).or_insert(1);
            loop {
                *count += 1;
                let candidate = format!("{base} #{count}");
                if !emitted.contains(&candidate) {
                    break candidate;
                }
            }
        } else {
            base
        };
        emitted.insert(name.clone());
        raw.remarks = name;

        result.push(raw);
    }

    result
}
