//! Background health manager: adaptive-interval monitor loop, R1-R5
//! demotion ladder, auto-pause hysteresis sweep (SPEC_FULL.md §4.2, §4.5).
//!
//! Grounded on `examples/original_source/tsproxy/proxyholder.py`
//! (`monitor_loop`, `_proxy_check`) and `cluster/health.rs` (teacher) for
//! the idiomatic tokio ticker/task shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

use crate::config::Thresholds;
use crate::pool::{Proxy, ProxyPool};
use crate::stat::StatStore;

/// A poke enqueued by the forwarding engine when a connection against a
/// given proxy finishes, carrying a short human-readable reason for the
/// log line (`ProxyHolder.check`).
pub struct CheckRequest {
    pub proxy: Arc<Proxy>,
    pub reason: String,
}

#[derive(Clone)]
pub struct HealthManager {
    pool: Arc<ProxyPool>,
    stats: Arc<StatStore>,
    thresholds: Thresholds,
    queue: mpsc::UnboundedSender<CheckRequest>,
    shutdown: Arc<AtomicBool>,
}

impl HealthManager {
    pub fn new(pool: Arc<ProxyPool>, stats: Arc<StatStore>, thresholds: Thresholds) -> (Self, mpsc::UnboundedReceiver<CheckRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            HealthManager {
                pool,
                stats,
                thresholds,
                queue: tx,
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Enqueues a check unless the proxy named is already mid-check,
    /// mirroring `ProxyHolder.check`'s `checking_proxy` short-circuit.
    pub fn request_check(&self, proxy: Arc<Proxy>, reason: impl Into<String>) {
        let _ = self.queue.send(CheckRequest {
            proxy,
            reason: reason.into(),
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// The monitor loop: waits on the check queue with an adaptive
    /// deadline. On a fast/slow-interval timeout it runs the full R1-R5
    /// ladder plus the auto-pause sweep; on a queued poke it re-runs the
    /// ladder scoped to the pokers' proxies.
    pub async fn run(self, mut queue: mpsc::UnboundedReceiver<CheckRequest>) {
        let mut check_interval = Duration::from_millis(100);
        while !self.shutdown.load(Ordering::Relaxed) {
            let mut batch: Vec<CheckRequest> = Vec::new();
            let mut timed_out = false;
            match timeout(check_interval, queue.recv()).await {
                Ok(Some(first)) => {
                    batch.push(first);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    while let Ok(next) = queue.try_recv() {
                        batch.push(next);
                    }
                }
                Ok(None) => break,
                Err(_) => timed_out = true,
            }

            if timed_out {
                if self.run_ladder(None).await {
                    check_interval = Duration::from_secs(self.thresholds.proxys_check_timeout_secs);
                } else {
                    check_interval = Duration::from_secs(self.thresholds.default_timeout_secs);
                }
            } else {
                for req in &batch {
                    let fail_rate = req.proxy.fail_rate(&self.stats).await;
                    let error_count = req.proxy.error_count().await;
                    if fail_rate > self.thresholds.fail_rate_threshold || error_count > 0 {
                        info!(
                            "health check triggered for {} ({}): fail_rate={:.2} error_count={}",
                            req.proxy.short_hostname, req.reason, fail_rate, error_count
                        );
                    }
                    self.run_ladder(Some(req.proxy.clone())).await;
                }
            }
        }
    }

    /// Runs the demotion ladder against the current head. If `scoped_to`
    /// names a proxy other than the head, the ladder is skipped entirely
    /// (`_proxy_check`'s "checking proxy is not the HEAD" early return).
    /// Returns whether the head now has enough TP90 samples (or the pool
    /// is unavailable) to justify backing off to the slow interval.
    async fn run_ladder(&self, scoped_to: Option<Arc<Proxy>>) -> bool {
        let head = match self.pool.head().await {
            Some(h) => h,
            None => return true,
        };
        if let Some(scoped) = &scoped_to {
            if scoped.short_hostname != head.short_hostname {
                return true;
            }
        }

        let global_tp90 = (self.stats.tp90_global().await * 10.0).round() / 10.0;
        info!("========== global tp90: {:.1} ==========", global_tp90);

        let fail_rate = head.fail_rate(&self.stats).await;
        let head_tp90 = head.tp90(&self.stats).await;
        let (tp90_inc_percent, last_tp90, _tp90_inc) = head.tp90_increment(&self.stats).await;
        let (sort_key_dec, last_sort_key) = head.sort_key_decrement(&self.stats, &self.thresholds, global_tp90).await;

        let mut move_tail = false;

        // R1: fail_rate exceeds threshold.
        if fail_rate > self.thresholds.fail_rate_threshold {
            if self.pool.try_select_head_proxy(true, true, 1.1).await.is_some() {
                move_tail = true;
                self.pool
                    .move_head_to_tail(
                        &head,
                        &format!(
                            "fail_rate={:.1}% > {:.1}%",
                            fail_rate * 100.0,
                            self.thresholds.fail_rate_threshold * 100.0
                        ),
                    )
                    .await;
            }
        // R2: head tp90 more than global_tp90_threshold times the global tp90.
        } else if global_tp90 > 0.0 && (head_tp90 / global_tp90) > self.thresholds.global_tp90_threshold {
            if self.pool.try_select_head_proxy(true, true, 1.1).await.is_some() {
                move_tail = true;
                self.pool
                    .move_head_to_tail(
                        &head,
                        &format!("tp90={:.1} > global_tp90={:.1} x {:.1}", head_tp90, global_tp90, self.thresholds.global_tp90_threshold),
                    )
                    .await;
            }
        // R3: tp90 jumped by more than tp90_inc_threshold since last reset.
        } else if tp90_inc_percent >= self.thresholds.tp90_inc_threshold {
            if self.pool.try_select_head_proxy(false, true, 1.0).await.is_some() {
                move_tail = true;
                self.pool
                    .move_head_to_tail(
                        &head,
                        &format!(
                            "tp90_inc({:.1}->{:.1} +{:.1}% > {:.1}%)",
                            last_tp90,
                            head_tp90,
                            tp90_inc_percent * 100.0,
                            self.thresholds.tp90_inc_threshold * 100.0
                        ),
                    )
                    .await;
            }
        }

        // R4: sort_key decrement is a separate, unconditional check — not
        // exclusive with R1-R3 above.
        if sort_key_dec >= self.thresholds.tp90_inc_threshold {
            let tp90_factor = if head_tp90 != 0.0 { global_tp90 / head_tp90 } else { 1.1 };
            if self.pool.try_select_head_proxy(false, true, tp90_factor).await.is_some() {
                move_tail = true;
                self.pool
                    .move_head_to_tail(
                        &head,
                        &format!(
                            "sort_key_dec({:.0}->{:.0} -{:.1}% > {:.1}%)",
                            last_sort_key,
                            head.sort_key(&self.stats, &self.thresholds, global_tp90).await,
                            sort_key_dec * 100.0,
                            self.thresholds.tp90_inc_threshold * 100.0
                        ),
                    )
                    .await;
            }
        }

        let current_head = if move_tail {
            self.pool.head().await.unwrap_or(head.clone())
        } else {
            head.clone()
        };

        // R5: only reached when nothing above moved the head — a busy
        // head gets a forced re-evaluation once it crosses the session
        // ceiling.
        if !move_tail && current_head.sess_count().await > self.thresholds.sess_count_ceiling {
            let moved = self.pool.try_select_head_proxy(false, false, 1.1).await.is_some();
            if !moved {
                current_head.reset_stat_info(&self.stats).await;
            }
        }

        self.pool.auto_pause_sweep().await;

        let final_head = self.pool.head().await.unwrap_or(current_head);
        let tp90_len = final_head.tp90_len(&self.stats).await;
        tp90_len >= self.thresholds.tp90_calc_count || !self.pool.available()
    }
}
