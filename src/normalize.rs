//! Vendor result normalization.
//!
//! Converts a vendor's raw result into canonical [`ParsedChunk`]s and
//! [`ParsedBlock`]s. Indices come from positions in the vendor arrays,
//! never from content, so normalizing the same payload twice yields the
//! same output.
//!
//! # Chunked payloads (polling vendor)
//!
//! `{ "chunks": [ { "content", "blocks": [ { "type", "content", "bbox", "confidence" } ] } ] }`
//! or a bare array of chunks. Missing block fields default to type
//! `unknown`, empty content, page 1 and zero geometry; a missing or
//! non-numeric confidence stays `None`.
//!
//! # Element payloads (extract vendor)
//!
//! `{ "elements": [ { "Text", "Path", "Page", "Bounds": [x0, y0, x1, y1] } ] }`
//! with a bottom-left origin. One chunk (index 0) is synthesized: every
//! element whose text is non-blank contributes its trimmed text followed
//! by `\n`, and one block whose `block_index` is the element's position.
//! Blank elements produce neither text nor a block. Blocks have
//! confidence `1.0`.

use serde::Deserialize;
use serde_json::Value;

use crate::error::ParseError;
use crate::models::{BoundingBox, ParsedBlock, ParsedChunk};
use crate::vendor::VendorKind;

/// Confidence assigned to extract-vendor blocks, which carry no score.
pub const EXTRACT_VENDOR_CONFIDENCE: f64 = 1.0;

/// Canonical output of normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedResult {
    pub chunks: Vec<ParsedChunk>,
    pub blocks: Vec<ParsedBlock>,
}

impl NormalizedResult {
    /// Text handed to fact extraction: chunk contents in index order,
    /// each followed by a newline.
    pub fn extraction_text(&self) -> String {
        extraction_text(&self.chunks)
    }
}

/// Newline-joined chunk contents in chunk-index order.
pub fn extraction_text(chunks: &[ParsedChunk]) -> String {
    let mut ordered: Vec<&ParsedChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);
    let mut text = String::new();
    for chunk in ordered {
        text.push_str(&chunk.content);
        text.push('\n');
    }
    text
}

#[derive(Deserialize, Default)]
struct RawChunk {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    blocks: Option<Vec<RawBlock>>,
}

#[derive(Deserialize, Default)]
struct RawBlock {
    #[serde(default, rename = "type")]
    block_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    bbox: Option<RawBBox>,
    #[serde(default)]
    confidence: Option<Value>,
}

#[derive(Deserialize, Default)]
struct RawBBox {
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    left: Option<f64>,
    #[serde(default)]
    top: Option<f64>,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    height: Option<f64>,
}

#[derive(Deserialize)]
#[allow(non_snake_case)]
struct RawElement {
    #[serde(default)]
    Text: Option<String>,
    #[serde(default)]
    Path: Option<String>,
    #[serde(default)]
    Page: Option<i64>,
    #[serde(default)]
    Bounds: Option<Vec<f64>>,
}

/// Normalize a raw vendor result.
pub fn normalize(vendor: VendorKind, raw: &Value) -> Result<NormalizedResult, ParseError> {
    match vendor {
        VendorKind::Reducto => normalize_chunked(raw),
        VendorKind::Adobe => normalize_elements(raw),
    }
}

fn normalize_chunked(raw: &Value) -> Result<NormalizedResult, ParseError> {
    let raw_chunks = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("chunks") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Null) | None => &[],
            Some(other) => {
                return Err(ParseError::Normalize(format!(
                    "chunks must be an array, got {}",
                    type_name(other)
                )))
            }
        },
        other => {
            return Err(ParseError::Normalize(format!(
                "expected chunk array or object, got {}",
                type_name(other)
            )))
        }
    };

    let mut result = NormalizedResult::default();
    for (c_index, raw_chunk) in raw_chunks.iter().enumerate() {
        let chunk: RawChunk = serde_json::from_value(raw_chunk.clone())
            .map_err(|e| ParseError::Normalize(format!("chunk {}: {}", c_index, e)))?;
        let chunk_index = c_index as i64;

        result.chunks.push(ParsedChunk {
            chunk_index,
            content: chunk.content.unwrap_or_default(),
        });

        for (b_index, block) in chunk.blocks.unwrap_or_default().into_iter().enumerate() {
            let bbox = block.bbox.unwrap_or_default();
            result.blocks.push(ParsedBlock {
                chunk_index,
                block_index: b_index as i64,
                block_type: block.block_type.unwrap_or_else(|| "unknown".to_string()),
                content: block.content.unwrap_or_default(),
                bbox: BoundingBox {
                    page: bbox.page.unwrap_or(1),
                    left: bbox.left.unwrap_or(0.0),
                    top: bbox.top.unwrap_or(0.0),
                    width: bbox.width.unwrap_or(0.0),
                    height: bbox.height.unwrap_or(0.0),
                },
                confidence: block.confidence.as_ref().and_then(numeric_confidence),
            });
        }
    }
    Ok(result)
}

fn normalize_elements(raw: &Value) -> Result<NormalizedResult, ParseError> {
    let elements = match raw.get("elements") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Null) | None => &[],
        Some(other) => {
            return Err(ParseError::Normalize(format!(
                "elements must be an array, got {}",
                type_name(other)
            )))
        }
    };

    let mut content = String::new();
    let mut blocks = Vec::new();

    for (index, raw_element) in elements.iter().enumerate() {
        let element: RawElement = serde_json::from_value(raw_element.clone())
            .map_err(|e| ParseError::Normalize(format!("element {}: {}", index, e)))?;

        let text = match element.Text.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => continue,
        };
        content.push_str(text);
        content.push('\n');

        blocks.push(ParsedBlock {
            chunk_index: 0,
            block_index: index as i64,
            block_type: element.Path.clone().unwrap_or_else(|| "text".to_string()),
            content: text.to_string(),
            bbox: element_bbox(element.Page, element.Bounds.as_deref()),
            confidence: Some(EXTRACT_VENDOR_CONFIDENCE),
        });
    }

    Ok(NormalizedResult {
        chunks: vec![ParsedChunk {
            chunk_index: 0,
            content,
        }],
        blocks,
    })
}

/// Convert `[x0, y0, x1, y1]` bottom-left-origin bounds into a canonical
/// box. The vendor's page numbers are 0-based. Anything but four bounds
/// leaves the geometry at zero.
fn element_bbox(page: Option<i64>, bounds: Option<&[f64]>) -> BoundingBox {
    let page = page.unwrap_or(0) + 1;
    match bounds {
        Some(&[x0, y0, x1, y1]) => BoundingBox {
            page,
            left: x0,
            top: y1,
            width: x1 - x0,
            height: y1 - y0,
        },
        _ => BoundingBox {
            page,
            ..BoundingBox::default()
        },
    }
}

fn numeric_confidence(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
