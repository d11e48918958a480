const PERSIST_BACKOFF_MS: &[u64] = &[100, 500, 2_000, 10_000];

/// Delay before persistence retry number `attempt` (1-based).
pub fn persist_backoff_ms(attempt: u32) -> u64 {
    let idx = (attempt.saturating_sub(1) as usize).min(PERSIST_BACKOFF_MS.len() - 1);
    PERSIST_BACKOFF_MS[idx]
}
