#![forbid(unsafe_code)]

//! Content codec for detached entries.
//!
//! `serialize` runs a one-way sanitization pass and then a reversible
//! compression step:
//!
//! 1. comments removed
//! 2. `<svg>` elements replaced by an empty marker
//! 3. large `<pre>` blocks replaced by a labeled stub keeping the language tag
//! 4. `style`, `class`, `id` and foreign `data-*` attributes stripped
//! 5. whitespace runs collapsed
//! 6. deflate + base64 when that is actually shorter
//!
//! `deserialize` only undoes step 6. Malformed input decodes to an empty
//! string; callers treat that as "content unavailable".
//!
//! # Size estimate
//!
//! [`Codec::estimate_size`] is a heuristic, not a measurement:
//! `utf16_len * 2 + node_count * node_overhead_bytes`.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use regex::{Captures, Regex};

use crate::config::CodecConfig;

/// Prefix for attributes owned by the engine; these survive sanitization.
pub const OWNED_ATTR_PREFIX: &str = "data-unloader-";

/// Dormant attribute holding a deferred resource reference.
pub const DORMANT_SRC_ATTR: &str = "data-unloader-src";

/// Marker left where a vector graphic used to be.
pub const GRAPHIC_MARKER: &str = "<i data-unloader-svg></i>";

const DROPPED_ATTRS: [&str; 3] = ["style", "class", "id"];

/// Serialized form of a collapsed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub data: String,
    pub compressed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    #[must_use]
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Sanitize and, when it pays off, compress `raw` markup.
    #[must_use]
    pub fn serialize(&self, raw: &str) -> StoredContent {
        let sanitized = self.sanitize(raw);
        let packed = if sanitized.len() >= self.config.compress_min_bytes {
            compress(&sanitized).filter(|packed| packed.len() < sanitized.len())
        } else {
            None
        };
        if let Some(packed) = packed {
            tracing::trace!(
                target: "unloader.codec",
                raw = raw.len(),
                sanitized = sanitized.len(),
                packed = packed.len(),
                "compressed stored content"
            );
            return StoredContent {
                data: packed,
                compressed: true,
            };
        }
        StoredContent {
            data: sanitized,
            compressed: false,
        }
    }

    /// Recover sanitized markup. Never fails; corrupt input yields `""`.
    #[must_use]
    pub fn deserialize(&self, stored: &str, is_compressed: bool) -> String {
        if stored.is_empty() {
            return String::new();
        }
        if !is_compressed {
            return stored.to_owned();
        }
        decompress(stored).unwrap_or_else(|| {
            tracing::debug!(
                target: "unloader.codec",
                len = stored.len(),
                "stored content failed to decode"
            );
            String::new()
        })
    }

    /// Heuristic memory footprint of a subtree, in bytes.
    #[must_use]
    pub fn estimate_size(&self, markup: &str, node_count: usize) -> u64 {
        let chars = markup.encode_utf16().count() as u64;
        chars * 2 + node_count as u64 * self.config.node_overhead_bytes
    }

    /// Steps 1-5 of the pipeline.
    #[must_use]
    pub fn sanitize(&self, raw: &str) -> String {
        let out = comment_re().replace_all(raw, "");
        let out = replace_graphics(out);
        let threshold = self.config.large_code_block_bytes;
        let out = replace_cow(out, pre_re(), |caps| {
            let body = caps.get(1).map_or("", |m| m.as_str());
            if body.len() < threshold {
                return caps[0].to_owned();
            }
            let lang = lang_re()
                .captures(&caps[0])
                .and_then(|c| c.get(1))
                .map_or("text", |m| m.as_str());
            format!("<pre data-unloader-code=\"{lang}\">[{lang} code block, expand to reload]</pre>")
        });
        let out = replace_cow(out, tag_re(), strip_tag_attrs);
        let out = whitespace_re().replace_all(&out, " ");
        out.trim().to_owned()
    }
}

fn replace_cow<'a, F>(input: Cow<'a, str>, re: &Regex, f: F) -> Cow<'a, str>
where
    F: FnMut(&Captures<'_>) -> String,
{
    let replaced = match re.replace_all(&input, f) {
        Cow::Owned(s) => Some(s),
        Cow::Borrowed(_) => None,
    };
    replaced.map_or(input, Cow::Owned)
}

/// Replace each outermost `<svg>` element with [`GRAPHIC_MARKER`], tracking
/// nesting depth. Stray closing tags are dropped; an unclosed element swallows
/// the rest of the input.
fn replace_graphics(input: Cow<'_, str>) -> Cow<'_, str> {
    if !svg_tag_re().is_match(&input) {
        return input;
    }
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;
    let mut last = 0;
    for tag in svg_tag_re().find_iter(&input) {
        let text = tag.as_str();
        if text.starts_with("</") {
            if depth == 0 {
                out.push_str(&input[last..tag.start()]);
                last = tag.end();
                continue;
            }
            depth -= 1;
            if depth == 0 {
                out.push_str(GRAPHIC_MARKER);
                last = tag.end();
            }
        } else if text.ends_with("/>") {
            if depth == 0 {
                out.push_str(&input[last..tag.start()]);
                out.push_str(GRAPHIC_MARKER);
                last = tag.end();
            }
        } else {
            if depth == 0 {
                out.push_str(&input[last..tag.start()]);
            }
            depth += 1;
        }
    }
    if depth > 0 {
        out.push_str(GRAPHIC_MARKER);
    } else {
        out.push_str(&input[last..]);
    }
    Cow::Owned(out)
}

fn strip_tag_attrs(caps: &Captures<'_>) -> String {
    let name = &caps[1];
    let attrs = caps.get(2).map_or("", |m| m.as_str());
    let self_closing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());

    let mut out = String::with_capacity(caps[0].len());
    out.push('<');
    out.push_str(name);
    for attr in attr_re().captures_iter(attrs) {
        let attr_name = &attr[1];
        let lower = attr_name.to_ascii_lowercase();
        if DROPPED_ATTRS.contains(&lower.as_str())
            || (lower.starts_with("data-") && !lower.starts_with(OWNED_ATTR_PREFIX))
        {
            continue;
        }
        out.push(' ');
        out.push_str(attr_name);
        let value = attr
            .get(2)
            .map(|m| Cow::Borrowed(m.as_str()))
            .or_else(|| attr.get(3).map(|m| Cow::Owned(m.as_str().replace('"', "&quot;"))))
            .or_else(|| attr.get(4).map(|m| Cow::Borrowed(m.as_str())));
        if let Some(value) = value {
            out.push_str("=\"");
            out.push_str(&value);
            out.push('"');
        }
    }
    if self_closing {
        out.push_str(" /");
    }
    out.push('>');
    out
}

fn compress(text: &str) -> Option<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).ok()?;
    let bytes = encoder.finish().ok()?;
    Some(STANDARD.encode(bytes))
}

fn decompress(data: &str) -> Option<String> {
    let bytes = STANDARD.decode(data.trim()).ok()?;
    let mut decoder = DeflateDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out).ok()?;
    Some(out)
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Collapse whitespace runs to single spaces and trim.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    whitespace_re().replace_all(text, " ").trim().to_owned()
}

/// Plain text of a markup fragment, like `textContent` but normalized.
#[must_use]
pub fn markup_text(markup: &str) -> String {
    let stripped = markup_tag_re().replace_all(markup, "");
    let decoded = entity_re().replace_all(&stripped, |caps: &Captures<'_>| decode_entity(&caps[1]));
    normalize_whitespace(&decoded)
}

fn decode_entity(name: &str) -> String {
    let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(dec) = name.strip_prefix('#') {
        dec.parse::<u32>().ok()
    } else {
        match name {
            "amp" => Some('&' as u32),
            "lt" => Some('<' as u32),
            "gt" => Some('>' as u32),
            "quot" => Some('"' as u32),
            "apos" => Some('\'' as u32),
            "nbsp" => Some(' ' as u32),
            _ => None,
        }
    };
    code.and_then(char::from_u32)
        .map_or_else(|| format!("&{name};"), String::from)
}

/// Move `src` of image-like elements to [`DORMANT_SRC_ATTR`].
#[must_use]
pub fn defer_sources(markup: &str) -> (String, usize) {
    let mut count = 0;
    let out = defer_re().replace_all(markup, |caps: &Captures<'_>| {
        count += 1;
        format!("{}{DORMANT_SRC_ATTR}=", &caps[1])
    });
    (out.into_owned(), count)
}

/// Inverse of [`defer_sources`].
#[must_use]
pub fn resume_sources(markup: &str) -> (String, usize) {
    let mut count = 0;
    let out = resume_re().replace_all(markup, |caps: &Captures<'_>| {
        count += 1;
        format!("{}src=", &caps[1])
    });
    (out.into_owned(), count)
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"))
}

fn svg_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<svg\b[^>]*>|</svg\s*>").expect("svg tag regex"))
}

fn pre_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<pre\b[^>]*>(.*?)</pre\s*>").expect("pre regex"))
}

fn lang_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"language-([A-Za-z0-9_+#.-]+)").expect("language regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"<([A-Za-z][A-Za-z0-9-]*)((?:\s+[^\s"'>/=]+(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'>]+))?)*)\s*(/?)>"#,
        )
        .expect("tag regex")
    })
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
            .expect("attribute regex")
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

fn markup_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->|<[^>]*>").expect("markup tag regex"))
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z]{2,8});").expect("entity regex")
    })
}

fn defer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(<(?:img|source|iframe|video|audio)\b[^>]*?\s)src\s*=").expect("defer regex")
    })
}

fn resume_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\s)data-unloader-src\s*=").expect("resume regex"))
}
