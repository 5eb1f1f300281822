use crate::models::ChunkDescriptor;
use crate::probe::ProbeReport;

/// Split `[0, total_size)` into consecutive chunks of `chunk_size` bytes.
///
/// The last chunk carries the remainder. An unknown size yields one
/// descriptor of unknown length starting at 0; a size of 0 yields no chunks.
pub fn plan(total_size: Option<u64>, chunk_size: u64) -> Vec<ChunkDescriptor> {
    let Some(total) = total_size else {
        return vec![ChunkDescriptor { index: 0, offset: 0, length: None }];
    };
    let chunk_size = chunk_size.max(1);
    let count = total.div_ceil(chunk_size);

    (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            ChunkDescriptor {
                index: i as usize,
                offset,
                length: Some(chunk_size.min(total - offset)),
            }
        })
        .collect()
}

/// Plan for what the probe found. Without range support the whole resource
/// is a single chunk, of known length when the size was reported.
pub fn plan_for(report: &ProbeReport, chunk_size: u64) -> Vec<ChunkDescriptor> {
    match report.total_size {
        Some(total) if !report.supports_ranges && total > 0 => {
            vec![ChunkDescriptor { index: 0, offset: 0, length: Some(total) }]
        }
        total => plan(total, chunk_size),
    }
}
