//! Image discovery inside reply text. The pipeline may hand back markdown
//! image literals, bare URLs, or local paths; everything sendable is pulled
//! out for the rich-media path and the text is cleaned up for delivery.

use std::collections::HashSet;
use std::sync::OnceLock;

use qqgate_core::MediaSource;
use regex::Regex;
use tracing::{debug, info};

use crate::media::classify_media_url;

/// Replacement for paragraphs that only talk *about* the image.
const IMAGE_NOTE: &str = "图片如上 ☝️";

fn markdown_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").unwrap())
}

fn bare_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // No lookbehind in this engine: capture the preceding char and keep it
    // during removal. Quote/bracket-preceded URLs belong to other syntax.
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(^|[^\(\['"])(https?://[^\s)\]'"]+?\.(?:png|jpe?g|gif|webp))"#).unwrap()
    })
}

fn bare_local_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|\s)(/[^\s'"()\[\]]+?\.(?:png|jpe?g|gif|webp|bmp))"#).unwrap()
    })
}

fn dotted_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Za-z0-9])\.([A-Za-z0-9])").unwrap())
}

fn apology_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"抱歉|对不起|不好意思|很遗憾",
            r"(无法|不能|没办法).{0,12}(直接|显示|发送|展示|预览)",
            r"(已经|已|刚刚).{0,8}(生成|保存|创建|发送).{0,12}(图片|图像|截图)",
            r"(图片|图像|截图).{0,12}(如下|在下方|已保存|已生成|发送失败)",
            r"(?i)\b(sorry|apologies|unfortunately)\b",
            r"(?i)\b(cannot|can't|unable to)\b.{0,24}\b(display|show|render|send)\b",
            r"(?i)\bas an ai\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

#[derive(Debug, Default)]
pub struct ResolvedImages {
    /// De-duplicated sendable sources, in discovery order.
    pub sources: Vec<MediaSource>,
    /// Reply text with the extracted literals removed and the meta chatter
    /// collapsed.
    pub cleaned_text: String,
}

/// Pull images out of a reply. `explicit_urls` (handed alongside the text by
/// the pipeline) come first, then markdown literals, then bare URLs. Bare
/// local paths outside markdown are logged but deliberately not sent.
pub fn resolve_images(text: &str, explicit_urls: &[String]) -> ResolvedImages {
    let mut seen: HashSet<String> = HashSet::new();
    let mut sources: Vec<MediaSource> = Vec::new();
    let mut push = |raw: &str, sources: &mut Vec<MediaSource>| {
        if let Some(source) = classify_media_url(raw) {
            if seen.insert(raw.trim().to_string()) {
                sources.push(source);
            }
        }
    };

    for url in explicit_urls {
        push(url, &mut sources);
    }

    let mut cleaned = text.to_string();

    // Markdown image literals are removed from the text whether or not the
    // target was sendable (a dangling literal renders as noise either way).
    cleaned = markdown_image_re()
        .replace_all(&cleaned, |caps: &regex::Captures| {
            let target = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            push(target, &mut sources);
            String::new()
        })
        .into_owned();

    cleaned = bare_url_re()
        .replace_all(&cleaned, |caps: &regex::Captures| {
            let url = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            push(url, &mut sources);
            caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string()
        })
        .into_owned();

    for caps in bare_local_path_re().captures_iter(&cleaned) {
        if let Some(path) = caps.get(1) {
            info!(path = %path.as_str(), "Bare local path in reply text; use a markdown image to send it");
        }
    }

    let cleaned_text = if sources.is_empty() {
        rewrite_dotted_tokens(&cleaned)
    } else {
        simplify_meta_text(&cleaned)
    };

    ResolvedImages {
        sources,
        cleaned_text,
    }
}

/// With images on the way, paragraphs that only apologize for or narrate the
/// image send are noise — collapse them to a short pointer at the image.
fn simplify_meta_text(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut collapsed = false;
    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_meta_paragraph(trimmed) {
            if !collapsed {
                out.push(IMAGE_NOTE);
                collapsed = true;
            }
            debug!(paragraph = %trimmed, "Collapsed meta paragraph");
        } else {
            out.push(trimmed);
        }
    }
    if out.is_empty() {
        return IMAGE_NOTE.to_string();
    }
    out.join("\n\n")
}

fn is_meta_paragraph(para: &str) -> bool {
    if apology_res().iter().any(|re| re.is_match(para)) {
        return true;
    }
    // Short paragraphs made mostly of filler words carry no content either.
    // A caption of a few words ("这是图") is still content, so tiny
    // paragraphs are exempt.
    let (total, stops) = stop_word_stats(para);
    para.chars().count() <= 40 && total >= 4 && stops * 4 >= total * 3
}

fn stop_word_ratio(text: &str) -> f64 {
    let (total, stops) = stop_word_stats(text);
    if total == 0 {
        return 0.0;
    }
    stops as f64 / total as f64
}

fn stop_word_stats(text: &str) -> (usize, usize) {
    const STOP_WORDS: [&str; 26] = [
        "的", "了", "我", "你", "他", "这", "那", "是", "在", "就", "都", "也", "还", "请", "看",
        "吧", "哦", "啊", "the", "a", "is", "it", "to", "of", "here", "you",
    ];
    let tokens: Vec<String> = text
        .split_whitespace()
        .flat_map(|w| {
            // Chinese runs carry no spaces; treat each han char as a token.
            if w.is_ascii() {
                vec![w.trim_matches(|c: char| c.is_ascii_punctuation()).to_lowercase()]
            } else {
                w.chars().map(|c| c.to_string()).collect()
            }
        })
        .filter(|t| !t.is_empty())
        .collect();
    let stops = tokens
        .iter()
        .filter(|t| STOP_WORDS.contains(&t.as_str()))
        .count();
    (tokens.len(), stops)
}

/// The platform blocks messages containing dotted tokens that look like
/// URLs. With no image in the send, rewrite `X.Y` between alphanumerics to
/// `X_Y` and say so in a footnote.
fn rewrite_dotted_tokens(text: &str) -> String {
    let mut current = text.to_string();
    let mut changed = false;
    // Overlapping matches (a.b.c) need repeated passes.
    loop {
        let next = dotted_token_re().replace_all(&current, "${1}_${2}").into_owned();
        if next == current {
            break;
        }
        changed = true;
        current = next;
    }
    if changed {
        current.push_str("\n（注：文本中的 . 已替换为 _，以规避平台对链接样式的拦截）");
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_image_extracted_and_removed() {
        let r = resolve_images("这是图\n![](/tmp/a.png)", &[]);
        assert_eq!(
            r.sources,
            vec![MediaSource::LocalPath("/tmp/a.png".into())]
        );
        assert_eq!(r.cleaned_text, "这是图");
    }

    #[test]
    fn test_markdown_with_public_url() {
        let r = resolve_images("看 ![alt](https://cdn.x/a.jpg) 完", &[]);
        assert_eq!(
            r.sources,
            vec![MediaSource::PublicUrl("https://cdn.x/a.jpg".to_string())]
        );
        assert_eq!(r.cleaned_text, "看  完");
    }

    #[test]
    fn test_bare_url_extracted() {
        let r = resolve_images("结果：https://img.example.com/pic.webp 请查收", &[]);
        assert_eq!(
            r.sources,
            vec![MediaSource::PublicUrl(
                "https://img.example.com/pic.webp".to_string()
            )]
        );
        assert!(!r.cleaned_text.contains("pic.webp"));
    }

    #[test]
    fn test_quoted_or_bracketed_urls_left_alone() {
        for text in [
            "(https://x/a.png)",
            "[https://x/a.png]",
            "'https://x/a.png'",
            "\"https://x/a.png\"",
        ] {
            let r = resolve_images(text, &[]);
            assert!(r.sources.is_empty(), "extracted from {:?}", text);
        }
    }

    #[test]
    fn test_bare_local_path_logged_not_sent() {
        let r = resolve_images("文件在 /tmp/shot.png 里", &[]);
        assert!(r.sources.is_empty());
        // Not removed either — only markdown form is consumed.
        assert!(r.cleaned_text.contains("/tmp/shot_png") || r.cleaned_text.contains("/tmp/shot.png"));
    }

    #[test]
    fn test_explicit_urls_come_first_and_dedupe() {
        let r = resolve_images(
            "![](https://x/a.png)",
            &["https://x/b.png".to_string(), "https://x/a.png".to_string()],
        );
        assert_eq!(
            r.sources,
            vec![
                MediaSource::PublicUrl("https://x/b.png".to_string()),
                MediaSource::PublicUrl("https://x/a.png".to_string()),
            ]
        );
    }

    #[test]
    fn test_data_url_in_markdown() {
        let data = "data:image/png;base64,iVBORw0KGgo=";
        let r = resolve_images(&format!("![img]({})", data), &[]);
        assert_eq!(r.sources, vec![MediaSource::DataUrl(data.to_string())]);
    }

    #[test]
    fn test_apology_paragraph_collapsed_when_sending_images() {
        let text = "抱歉，我无法直接显示图片。\n\n![](https://x/a.png)\n\n这是您要的统计结果。";
        let r = resolve_images(text, &[]);
        assert_eq!(r.sources.len(), 1);
        assert!(r.cleaned_text.contains(IMAGE_NOTE));
        assert!(r.cleaned_text.contains("统计结果"));
        assert!(!r.cleaned_text.contains("抱歉"));
    }

    #[test]
    fn test_all_meta_text_becomes_single_note() {
        let text = "Sorry, I cannot display the image directly.\n\n![](https://x/a.png)";
        let r = resolve_images(text, &[]);
        assert_eq!(r.cleaned_text, IMAGE_NOTE);
    }

    #[test]
    fn test_dotted_tokens_rewritten_without_images() {
        let r = resolve_images("推荐 node.js 和 vue.js", &[]);
        assert!(r.sources.is_empty());
        assert!(r.cleaned_text.contains("node_js"));
        assert!(r.cleaned_text.contains("vue_js"));
        assert!(r.cleaned_text.contains("（注："));
    }

    #[test]
    fn test_consecutive_dots_rewritten() {
        let r = resolve_images("版本 1.2.3 发布", &[]);
        assert!(r.cleaned_text.contains("1_2_3"));
    }

    #[test]
    fn test_clean_text_untouched_without_dots_or_images() {
        let r = resolve_images("你好，世界", &[]);
        assert_eq!(r.cleaned_text, "你好，世界");
    }

    #[test]
    fn test_no_rewrite_when_images_present() {
        // With an image in the send the dotted-token rule does not apply.
        let r = resolve_images("node.js 架构图 ![](https://x/a.png)", &[]);
        assert_eq!(r.sources.len(), 1);
        assert!(r.cleaned_text.contains("node.js"));
    }

    #[test]
    fn test_stop_word_ratio() {
        assert!(stop_word_ratio("的 了 我 你") >= 0.9);
        assert!(stop_word_ratio("量子计算入门教程第三章") < 0.5);
    }
}
