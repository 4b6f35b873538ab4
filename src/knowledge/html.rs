//! HTML 处理：正文区域提取与同站链接提取
//!
//! 正文优先取 `<main>`，其次 `<article>`、`<body>`，都没有时退回整页；
//! 先去掉 script/style/noscript，再用 html2text 转为可读文本，失败时用简易去标签回退。

use std::sync::OnceLock;

use html2text::from_read;
use regex::Regex;
use reqwest::Url;

/// 非文档类扩展名：图片、压缩包、音视频、字体、样式/脚本
const EXCLUDED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "bmp", "tif", "tiff", "avif",
    "zip", "tar", "gz", "tgz", "bz2", "xz", "rar", "7z", "dmg", "exe", "iso",
    "mp4", "mov", "avi", "mkv", "webm", "wmv", "flv", "m4v",
    "mp3", "wav", "ogg", "flac", "m4a",
    "woff", "woff2", "ttf", "otf", "eot",
    "css", "js", "map",
];

fn noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript|template)\b[^>]*>.*?</(script|style|noscript|template)\s*>")
            .expect("static regex")
    })
}

fn region_re(tag: &str) -> Regex {
    Regex::new(&format!(r"(?is)<{tag}\b[^>]*>(.*)</{tag}\s*>")).expect("static regex")
}

fn region_res() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| [region_re("main"), region_re("article"), region_re("body")])
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
            .expect("static regex")
    })
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 提取页面正文文本
pub fn extract_main_text(html: &str) -> String {
    let cleaned = noise_re().replace_all(html, " ");
    let region = region_res()
        .iter()
        .find_map(|re| re.captures(&cleaned).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(cleaned.as_ref());

    let text = match from_read(region.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(region),
    };
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// 是否指向非文档资源
fn has_excluded_extension(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((_, ext)) => EXCLUDED_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// 网络位置（host + 端口）是否一致
pub fn same_location(a: &Url, b: &Url) -> bool {
    a.host_str().map(str::to_ascii_lowercase) == b.host_str().map(str::to_ascii_lowercase)
        && a.port_or_known_default() == b.port_or_known_default()
}

/// 规范化用作 visited 键：去掉 fragment
pub fn normalize(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// 提取与 `base` 同一网络位置的文档链接（绝对化、去 fragment、去重保序）
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for caps in href_re().captures_iter(html) {
        let Some(raw) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let raw = raw.as_str().trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let Ok(url) = base.join(raw) else { continue };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        let url = normalize(url);
        if !same_location(&url, base) || has_excluded_extension(&url) {
            continue;
        }
        if seen.insert(url.as_str().to_string()) {
            links.push(url);
        }
    }

    links
}
