use crate::options::RunOptions;
use crate::{Result, ScrapeError};
use rand::Rng;
use std::collections::BTreeSet;

/// Upper bound on the random jitter added to each retry delay.
const RETRY_JITTER_MS: u64 = 250;

/// The set of posts one run will visit, resolved up front from the requested
/// range, the local download state, and (in sequential mode) the remote
/// maximum post number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostPlan {
    /// Walk every post number from `start` through `end` inclusive.
    Sequential { start: u64, end: u64 },
    /// Visit exactly these post numbers, ascending.
    FillGaps { targets: Vec<u64> },
}

impl PostPlan {
    pub fn len(&self) -> u64 {
        match self {
            PostPlan::Sequential { start, end } => {
                if end < start {
                    0
                } else {
                    end - start + 1
                }
            }
            PostPlan::FillGaps { targets } => targets.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn posts(&self) -> Box<dyn Iterator<Item = u64> + '_> {
        match self {
            PostPlan::Sequential { start, end } => {
                if end < start {
                    Box::new(std::iter::empty())
                } else {
                    Box::new(*start..=*end)
                }
            }
            PostPlan::FillGaps { targets } => Box::new(targets.iter().copied()),
        }
    }
}

/// Resolves the run's post plan.
///
/// Sequential mode resumes after the highest locally downloaded post unless a
/// start is given, and runs to the explicit end, else the remote maximum,
/// else just the start post. Fill-gaps mode walks the missing numbers inside
/// the already-downloaded range. `max_posts` caps both.
pub fn plan_posts(
    options: &RunOptions,
    downloaded: &BTreeSet<u64>,
    remote_max: Option<u64>,
) -> PostPlan {
    if options.fill_gaps {
        let start = options.start.unwrap_or(1);
        let Some(end) = options.end.or_else(|| downloaded.iter().next_back().copied()) else {
            return PostPlan::FillGaps {
                targets: Vec::new(),
            };
        };
        let mut targets: Vec<u64> = (start..=end)
            .filter(|post| !downloaded.contains(post))
            .collect();
        if let Some(max_posts) = options.max_posts {
            targets.truncate(max_posts as usize);
        }
        return PostPlan::FillGaps { targets };
    }

    let start = options
        .start
        .or_else(|| downloaded.iter().next_back().map(|last| last + 1))
        .unwrap_or(1);
    let mut end = options.end.or(remote_max).unwrap_or(start);
    if let Some(max_posts) = options.max_posts {
        end = end.min(start.saturating_add(max_posts - 1));
    }
    PostPlan::Sequential { start, end }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_options(options: &RunOptions) -> Self {
        Self {
            retries: options.retries,
            base_delay_ms: options.retry_delay_ms,
        }
    }

    /// Exponential backoff with a small uniform jitter. `attempt` is
    /// zero-based; the exponent is clamped so large retry counts cannot
    /// overflow.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64 << attempt.min(20);
        let base = self.base_delay_ms.saturating_mul(factor);
        base.saturating_add(rand::thread_rng().gen_range(0..RETRY_JITTER_MS))
    }
}

/// Runs `op` up to `retries + 1` times, sleeping between attempts via the
/// injected hook. The final error is returned unchanged.
pub fn with_retries<T, F>(
    policy: &RetryPolicy,
    sleep: &mut dyn FnMut(u64),
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let mut last_err: Option<ScrapeError> = None;
    for attempt in 0..=policy.retries {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt < policy.retries {
                    sleep(policy.delay_ms(attempt));
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ScrapeError::Config("retry with zero attempts".to_string())))
}
