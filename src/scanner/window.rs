use crate::error::{RekeyError, Result};
use crate::storage::IdWindow;

/// Partition `[min_id, max_id]` into contiguous windows of `size` ids.
///
/// The last window is clipped to `max_id`; there are `ceil(span / size)`
/// windows and every id falls into exactly one of them. Windows are produced
/// on demand, so a sparse table with a huge id range costs no memory up front.
pub fn plan_windows(min_id: i64, max_id: i64, size: u64) -> Result<WindowPlan> {
    if size == 0 {
        return Err(RekeyError::InvalidArgument("window size must be positive".into()));
    }
    let size = i64::try_from(size)
        .map_err(|_| RekeyError::InvalidArgument(format!("window size {size} too large")))?;
    Ok(WindowPlan {
        next_start: (min_id <= max_id).then_some(min_id),
        max_id,
        size,
    })
}

/// Iterator over the windows of a [`plan_windows`] partition.
#[derive(Debug, Clone)]
pub struct WindowPlan {
    next_start: Option<i64>,
    max_id: i64,
    size: i64,
}

impl WindowPlan {
    /// Windows not yet yielded.
    pub fn remaining(&self) -> u64 {
        match self.next_start {
            Some(start) => {
                let span = i128::from(self.max_id) - i128::from(start) + 1;
                let size = i128::from(self.size);
                ((span + size - 1) / size) as u64
            }
            None => 0,
        }
    }
}

impl Iterator for WindowPlan {
    type Item = IdWindow;

    fn next(&mut self) -> Option<IdWindow> {
        let start = self.next_start?;
        let end = start.saturating_add(self.size - 1).min(self.max_id);
        self.next_start = (end < self.max_id).then(|| end + 1);
        Some(IdWindow { start, end })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining()).ok();
        (n.unwrap_or(usize::MAX), n)
    }
}
