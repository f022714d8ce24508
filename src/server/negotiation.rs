//! Content negotiation: `Accept` header + `?format=` + endpoint format
//! config decide the response form.
//!
//! Priority: explicit `?format=` query override, then the parsed `Accept`
//! header by descending quality, then the endpoint default. Negotiation is
//! deterministic for a given input triple.

use std::collections::BTreeMap;

use crate::config::ResponseFormatConfig;

pub const ARROW_MIME: &str = "application/vnd.apache.arrow.stream";

/// One parsed `Accept` entry, e.g.
/// `application/vnd.apache.arrow.stream;codec=zstd;q=0.9`.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaType {
    pub r#type: String,
    pub subtype: String,
    pub quality: f64,
    pub parameters: BTreeMap<String, String>,
}

impl MediaType {
    pub fn full_type(&self) -> String {
        format!("{}/{}", self.r#type, self.subtype)
    }

    pub fn is_arrow_stream(&self) -> bool {
        self.full_type() == ARROW_MIME
    }

    pub fn is_json(&self) -> bool {
        self.full_type() == "application/json"
    }

    pub fn is_csv(&self) -> bool {
        self.full_type() == "text/csv"
    }

    pub fn is_wildcard(&self) -> bool {
        self.r#type == "*" && self.subtype == "*"
    }
}

/// Selected response form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    ArrowStream,
    Csv,
    Unsupported,
}

impl ResponseFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::ArrowStream => ARROW_MIME,
            Self::Csv => "text/csv",
            Self::Unsupported => "text/plain",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationResult {
    pub format: ResponseFormat,
    /// Arrow compression codec (`lz4`/`zstd`), empty for none.
    pub codec: String,
    pub error_message: String,
}

impl NegotiationResult {
    fn unsupported(message: impl Into<String>) -> Self {
        Self {
            format: ResponseFormat::Unsupported,
            codec: String::new(),
            error_message: message.into(),
        }
    }

    fn format(format: ResponseFormat) -> Self {
        Self {
            format,
            codec: String::new(),
            error_message: String::new(),
        }
    }
}

/// Parse an `Accept` header per RFC 7231 into entries sorted stably by
/// quality, highest first. Malformed entries are skipped.
pub fn parse_accept_header(header: &str) -> Vec<MediaType> {
    let mut result = Vec::new();

    for entry in header.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let mut parts = entry.split(';');
        let Some(type_subtype) = parts.next() else {
            continue;
        };
        let type_subtype = type_subtype.trim();
        let Some((main, sub)) = type_subtype.split_once('/') else {
            // Invalid media type without a slash.
            continue;
        };

        let mut media_type = MediaType {
            r#type: main.trim().to_ascii_lowercase(),
            subtype: sub.trim().to_ascii_lowercase(),
            quality: 1.0,
            parameters: BTreeMap::new(),
        };

        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if key == "q" {
                media_type.quality = value.parse::<f64>().unwrap_or(1.0).clamp(0.0, 1.0);
            } else {
                media_type.parameters.insert(key, value);
            }
        }

        result.push(media_type);
    }

    // Stable sort preserves header order within equal quality.
    result.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    result
}

fn format_from_name(name: &str) -> ResponseFormat {
    match name.to_ascii_lowercase().as_str() {
        "json" => ResponseFormat::Json,
        "arrow" => ResponseFormat::ArrowStream,
        "csv" => ResponseFormat::Csv,
        _ => ResponseFormat::Unsupported,
    }
}

fn default_format(config: &ResponseFormatConfig) -> ResponseFormat {
    match config.default_format.to_ascii_lowercase().as_str() {
        "arrow" if config.arrow_enabled => ResponseFormat::ArrowStream,
        "csv" if config.supports("csv") => ResponseFormat::Csv,
        _ if config.supports("json") => ResponseFormat::Json,
        _ => ResponseFormat::Unsupported,
    }
}

/// Negotiate the response format for one request.
pub fn negotiate(
    accept_header: &str,
    format_query: Option<&str>,
    config: &ResponseFormatConfig,
) -> NegotiationResult {
    // Priority 1: explicit query override.
    if let Some(format_query) = format_query.filter(|f| !f.is_empty()) {
        let lower = format_query.to_ascii_lowercase();
        if !config.supports(&lower) {
            return NegotiationResult::unsupported(format!(
                "Format '{format_query}' is not supported by this endpoint"
            ));
        }
        if lower == "arrow" && !config.arrow_enabled {
            return NegotiationResult::unsupported(
                "Arrow format is not enabled for this endpoint",
            );
        }
        return NegotiationResult::format(format_from_name(&lower));
    }

    // Priority 2: Accept header, by descending quality.
    let media_types = parse_accept_header(accept_header);
    for media_type in &media_types {
        // q=0 means "not acceptable".
        if media_type.quality <= 0.0 {
            continue;
        }

        if media_type.is_arrow_stream() {
            if config.arrow_enabled && config.supports("arrow") {
                let mut result = NegotiationResult::format(ResponseFormat::ArrowStream);
                if let Some(codec) = media_type.parameters.get("codec") {
                    let codec = codec.to_ascii_lowercase();
                    // Unknown codecs are silently ignored.
                    if codec == "lz4" || codec == "zstd" {
                        result.codec = codec;
                    }
                }
                return result;
            }
            continue;
        }

        if media_type.is_json() {
            if config.supports("json") {
                return NegotiationResult::format(ResponseFormat::Json);
            }
            continue;
        }

        if media_type.is_csv() {
            if config.supports("csv") {
                return NegotiationResult::format(ResponseFormat::Csv);
            }
            continue;
        }

        if media_type.is_wildcard() {
            let format = default_format(config);
            if format == ResponseFormat::Unsupported {
                return NegotiationResult::unsupported("No supported response format available");
            }
            return NegotiationResult::format(format);
        }
    }

    // Priority 3: empty or unparseable Accept falls back to the default.
    if media_types.is_empty() {
        let format = default_format(config);
        if format == ResponseFormat::Unsupported {
            return NegotiationResult::unsupported("No supported response format available");
        }
        return NegotiationResult::format(format);
    }

    NegotiationResult::unsupported("No acceptable response format found")
}
