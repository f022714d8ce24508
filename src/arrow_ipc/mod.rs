//! Columnar serializer: engine result batches to an Arrow IPC stream.
//!
//! The stream is written batch-by-batch (schema prefix, one record batch
//! per engine chunk, end-of-stream marker) under a coarse memory guard,
//! then optionally compressed in one shot with ZSTD or LZ4. Compression
//! failures fall back to the uncompressed stream silently; an invalid
//! codec name is an error before any work starts.

pub mod metrics;

use std::io::Write as _;

use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::ipc::writer::StreamWriter;
use datafusion::execution::SendableRecordBatchStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::errors::{FlapiError, Result, SerializerErrorKind};
use metrics::StreamMarker;

/// Coarse per-row memory estimate used by the guard.
const ROW_MEMORY_ESTIMATE: u64 = 100;

const DEFAULT_BATCH_SIZE: usize = 8192;
const DEFAULT_MAX_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Serializer configuration.
#[derive(Debug, Clone)]
pub struct ArrowSerializerConfig {
    /// Advisory rows per batch; actual batching follows the engine's
    /// chunking.
    pub batch_size: usize,
    /// Compression codec: `""`, `"lz4"` or `"zstd"`, case-insensitive.
    pub codec: String,
    /// ZSTD level, clamped to `1..=22`; `0` selects the default.
    pub compression_level: i32,
    pub max_memory_bytes: u64,
}

impl Default for ArrowSerializerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            codec: String::new(),
            compression_level: 0,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
        }
    }
}

impl ArrowSerializerConfig {
    pub fn with_codec(mut self, codec: &str) -> Self {
        self.codec = codec.to_string();
        self
    }
}

pub fn normalize_codec_name(codec: &str) -> String {
    codec.to_ascii_lowercase()
}

pub fn is_valid_codec(codec: &str) -> bool {
    matches!(normalize_codec_name(codec).as_str(), "" | "zstd" | "lz4")
}

/// Completed serialization.
#[derive(Debug)]
pub struct SerializedStream {
    /// Final bytes handed to the transport (compressed when a codec ran).
    pub data: Vec<u8>,
    pub row_count: u64,
    pub batch_count: u64,
    /// IPC bytes before compression.
    pub bytes_uncompressed: u64,
    /// Codec that actually produced `data` (empty after a fallback).
    pub codec: String,
}

/// Arrow C-interface format string for an engine column type. Types with
/// no mapping fall back to plain UTF-8 so the stream stays decodable.
pub fn arrow_format_code(data_type: &DataType) -> Option<&'static str> {
    match data_type {
        DataType::Boolean => Some("b"),
        DataType::Int8 => Some("c"),
        DataType::Int16 => Some("s"),
        DataType::Int32 => Some("i"),
        DataType::Int64 => Some("l"),
        DataType::UInt8 => Some("C"),
        DataType::UInt16 => Some("S"),
        DataType::UInt32 => Some("I"),
        DataType::UInt64 => Some("L"),
        DataType::Float32 => Some("f"),
        DataType::Float64 => Some("g"),
        DataType::Utf8 => Some("u"),
        DataType::Binary => Some("z"),
        DataType::Date32 => Some("tdD"),
        DataType::Time64(TimeUnit::Microsecond) => Some("ttu"),
        DataType::Timestamp(TimeUnit::Second, _) => Some("tss:"),
        DataType::Timestamp(TimeUnit::Millisecond, _) => Some("tsm:"),
        DataType::Timestamp(TimeUnit::Microsecond, _) => Some("tsu:"),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => Some("tsn:"),
        DataType::Interval(_) => Some("tiM"),
        _ => None,
    }
}

/// Build the wire schema: every field nullable, unsupported types mapped
/// to UTF-8. Returns the schema and whether any column needs casting.
pub fn schema_for_ipc(schema: &Schema) -> (SchemaRef, bool) {
    let mut changed = false;
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| {
            let data_type = if arrow_format_code(field.data_type()).is_some() {
                field.data_type().clone()
            } else {
                changed = true;
                DataType::Utf8
            };
            if !field.is_nullable() || &data_type != field.data_type() {
                changed = true;
            }
            Field::new(field.name(), data_type, true)
        })
        .collect();
    (std::sync::Arc::new(Schema::new(fields)), changed)
}

fn normalize_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let columns = batch
        .columns()
        .iter()
        .zip(target.fields())
        .map(|(column, field)| {
            if column.data_type() == field.data_type() {
                Ok(column.clone())
            } else {
                cast(column, field.data_type()).map_err(FlapiError::from)
            }
        })
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(target.clone(), columns).map_err(FlapiError::from)
}

/// Serialize an engine cursor stream into a complete IPC byte stream.
pub async fn serialize_stream(
    mut stream: SendableRecordBatchStream,
    config: &ArrowSerializerConfig,
) -> Result<SerializedStream> {
    if !is_valid_codec(&config.codec) {
        return Err(FlapiError::serializer(
            SerializerErrorKind::Compression,
            format!("invalid codec: {}", config.codec),
        ));
    }

    let marker = StreamMarker::start();
    let (target_schema, _) = schema_for_ipc(stream.schema().as_ref());

    let mut buffer = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buffer, &target_schema)?;

    let mut row_count: u64 = 0;
    let mut batch_count: u64 = 0;
    let mut memory_estimate: u64 = 0;

    loop {
        // Enforce the memory guard before pulling the next chunk.
        if memory_estimate > config.max_memory_bytes {
            drop(writer);
            metrics::ARROW_METRICS.release_memory(memory_estimate);
            marker.failure(SerializerErrorKind::Memory);
            return Err(FlapiError::serializer(
                SerializerErrorKind::Memory,
                format!(
                    "memory estimate {memory_estimate} exceeds limit {}",
                    config.max_memory_bytes
                ),
            ));
        }

        let Some(next) = stream.next().await else {
            break;
        };
        let batch = next.map_err(|e| FlapiError::Engine(e.to_string()))?;
        if batch.num_rows() == 0 {
            continue;
        }

        let rows = batch.num_rows() as u64;
        let normalized = normalize_batch(&batch, &target_schema)?;
        writer.write(&normalized)?;

        row_count += rows;
        batch_count += 1;
        memory_estimate += rows * ROW_MEMORY_ESTIMATE;
        metrics::ARROW_METRICS.add_memory(rows * ROW_MEMORY_ESTIMATE);
        marker.record_batch(rows);
    }

    writer.finish()?;
    drop(writer);
    metrics::ARROW_METRICS.release_memory(memory_estimate);

    let bytes_uncompressed = buffer.len() as u64;
    let codec = normalize_codec_name(&config.codec);

    let (data, applied_codec, bytes_compressed) = if codec.is_empty() {
        (buffer, String::new(), None)
    } else {
        match compress(&buffer, &codec, config.compression_level) {
            Ok(compressed) => {
                let size = compressed.len() as u64;
                (compressed, codec, Some(size))
            }
            Err(e) => {
                // Silent fallback to the uncompressed stream.
                warn!("Compression with {codec} failed, sending uncompressed: {e}");
                marker.compression_error();
                (buffer, String::new(), None)
            }
        }
    };

    marker.success(row_count, batch_count, bytes_uncompressed, bytes_compressed);

    debug!(
        rows = row_count,
        batches = batch_count,
        bytes = data.len(),
        "Arrow stream serialized"
    );

    Ok(SerializedStream {
        data,
        row_count,
        batch_count,
        bytes_uncompressed,
        codec: applied_codec,
    })
}

fn compress(input: &[u8], codec: &str, level: i32) -> Result<Vec<u8>> {
    match codec {
        "zstd" => compress_zstd(input, level),
        "lz4" => compress_lz4(input),
        other => Err(FlapiError::serializer(
            SerializerErrorKind::Compression,
            format!("invalid codec: {other}"),
        )),
    }
}

/// ZSTD with the level clamped to `1..=22` (default 3).
fn compress_zstd(input: &[u8], level: i32) -> Result<Vec<u8>> {
    let level = if level <= 0 {
        DEFAULT_ZSTD_LEVEL
    } else {
        level.min(22)
    };
    zstd::bulk::compress(input, level)
        .map_err(|e| FlapiError::serializer(SerializerErrorKind::Compression, e.to_string()))
}

/// LZ4 frame format with a content-size prelude.
fn compress_lz4(input: &[u8]) -> Result<Vec<u8>> {
    let mut frame_info = lz4_flex::frame::FrameInfo::new();
    frame_info.content_size = Some(input.len() as u64);

    let mut encoder = lz4_flex::frame::FrameEncoder::with_frame_info(frame_info, Vec::new());
    encoder
        .write_all(input)
        .map_err(|e| FlapiError::serializer(SerializerErrorKind::Compression, e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| FlapiError::serializer(SerializerErrorKind::Compression, e.to_string()))
}
