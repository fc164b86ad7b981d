//! progressive water-filling over the upload budgets

/// The largest rate `r` such that `k` concurrent sources can each be fed `r`,
/// given every node can upload at most `min(upload, r)`.
///
/// Nodes whose upload exceeds the current fair share are pinned at their own cap,
/// the divisor shrinks by one for each of them, and the share is recomputed from the rest.
/// The largest remaining upload is pinned first, so the result does not depend on node order.
pub(crate) fn fair_share(uploads: &[u64], k: usize) -> u64 {
    let mut pinned = vec![false; uploads.len()];
    let mut divider = k as u64;
    while divider > 0 {
        let (sum, max_upload) = uploads
            .iter()
            .zip(&pinned)
            .filter(|(_, pinned)| !**pinned)
            .fold((0u64, 0u64), |(sum, max), (&upload, _)| {
                (sum.saturating_add(upload), max.max(upload))
            });
        if max_upload.saturating_mul(divider) <= sum {
            return sum / divider;
        }
        for (upload, pinned) in uploads.iter().zip(pinned.iter_mut()) {
            if !*pinned && *upload == max_upload {
                *pinned = true;
                divider = divider.saturating_sub(1);
            }
        }
    }
    0
}
