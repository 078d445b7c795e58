use crate::error::{DeployError, DeployResult};
use cmd_lib::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    /// Number of polls before giving up. The first poll happens immediately.
    pub max_attempts: u32,
    pub show_progress: bool,
}

impl WaitPolicy {
    /// No sleeping between polls, no spinner.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            poll_interval: Duration::ZERO,
            max_attempts,
            show_progress: false,
        }
    }
}

fn spinner(kind: &str, total: usize) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("Waiting for {total} {kind}(s)..."));
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Poll every resource in `ids` until `is_ready` holds for all of them.
///
/// Each poll re-fetches the live state of every resource through `fetch`;
/// nothing is cached between polls. Returns the states observed on the poll
/// where everything was ready, in the order of `ids`. Fails with
/// [`DeployError::ResourceNotReady`] once `policy.max_attempts` polls have
/// been spent, and propagates any error from `fetch` immediately.
pub fn wait_until<S, F, P>(
    kind: &'static str,
    ids: &[String],
    mut fetch: F,
    is_ready: P,
    policy: &WaitPolicy,
) -> DeployResult<Vec<S>>
where
    F: FnMut(&str) -> DeployResult<S>,
    P: Fn(&S) -> bool,
{
    let progress = (policy.show_progress && !ids.is_empty()).then(|| spinner(kind, ids.len()));
    let mut pending = Vec::new();

    for attempt in 1..=policy.max_attempts {
        let mut states = Vec::with_capacity(ids.len());
        pending.clear();
        for id in ids {
            let state = fetch(id)?;
            if !is_ready(&state) {
                pending.push(id.clone());
            }
            states.push(state);
        }

        if pending.is_empty() {
            if let Some(pb) = &progress {
                pb.finish_and_clear();
            }
            debug!("All {} {kind}(s) ready after {attempt} poll(s)", ids.len());
            return Ok(states);
        }

        match &progress {
            Some(pb) => pb.set_message(format!(
                "Waiting for {kind}(s): {} of {} pending (poll {attempt}/{})",
                pending.len(),
                ids.len(),
                policy.max_attempts
            )),
            None => info!("Waiting for {kind}(s) {}", pending.join(", ")),
        }

        if attempt < policy.max_attempts {
            std::thread::sleep(policy.poll_interval);
        }
    }

    if let Some(pb) = &progress {
        pb.abandon();
    }
    Err(DeployError::ResourceNotReady {
        kind,
        pending,
        attempts: policy.max_attempts,
    })
}
