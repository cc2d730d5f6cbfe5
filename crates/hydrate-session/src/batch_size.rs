//! Batch-size sequences for the padded and legacy loaders.

use hydrate_core::{Error, MappingErrorKind, Result};

/// Sizes up to this step down by one; larger sizes halve, but never below it.
const LINEAR_STEP_LIMIT: usize = 10;

/// The descending sequence of pre-built batch sizes for `max_batch_size`.
///
/// `generate_batch_sizes(30)` is `[30, 15, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1]`.
pub fn generate_batch_sizes(max_batch_size: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size = max_batch_size.max(1);
    sizes.push(size);
    while size > 1 {
        size = if size <= LINEAR_STEP_LIMIT {
            size - 1
        } else if size / 2 < LINEAR_STEP_LIMIT {
            LINEAR_STEP_LIMIT
        } else {
            size / 2
        };
        sizes.push(size);
    }
    sizes
}

/// Check that `sizes` starts at `max_batch_size`, ends at 1 and strictly
/// decreases.
pub fn validate_batch_sizes(
    entity_name: &str,
    max_batch_size: usize,
    sizes: &[usize],
) -> Result<()> {
    let invalid = |message: String| {
        Err(Error::mapping(
            MappingErrorKind::BatchSizes,
            Some(entity_name),
            message,
        ))
    };
    match sizes {
        [] => return invalid("batch size sequence is empty".to_string()),
        [first, ..] if *first != max_batch_size => {
            return invalid(format!(
                "batch size sequence must start at the configured maximum {max_batch_size}, not {first}"
            ));
        }
        [.., 1] => {}
        [.., last] => {
            return invalid(format!("batch size sequence must end at 1, not {last}"));
        }
    }
    if let Some(pair) = sizes.windows(2).find(|w| w[0] <= w[1]) {
        return invalid(format!(
            "batch size sequence {sizes:?} is not strictly decreasing at {} -> {}",
            pair[0], pair[1]
        ));
    }
    Ok(())
}
