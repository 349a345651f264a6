// src/commands/progress.rs
//! Terminal rendering of worker signals
//!
//! One bar shows the current action and percent. Warnings and errors are
//! printed above it so they survive the bar being redrawn.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use pkgwarden::progress::Signal;
use pkgwarden::progress::format_size;
use std::time::Duration;
use tokio::sync::broadcast;

/// Bar resolution; percent signals are fractions
const BAR_LENGTH: u64 = 1000;

/// How a transaction ended, as reported by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finished {
    Done(String),
    Failed(String),
}

/// Renders the signal stream of one transaction
pub struct SignalRenderer {
    multi: MultiProgress,
    bar: ProgressBar,
    action: String,
    target: String,
    pulsing: bool,
}

impl SignalRenderer {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let bar = multi.add(ProgressBar::new(BAR_LENGTH));
        let renderer = Self {
            multi,
            bar,
            action: String::new(),
            target: String::new(),
            pulsing: false,
        };
        renderer.show_pulse();
        renderer
    }

    fn show_pulse(&self) {
        self.bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn show_fraction(&self) {
        self.bar.disable_steady_tick();
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.green/dim}] {percent}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
    }

    fn refresh_message(&self) {
        if self.target.is_empty() {
            self.bar.set_message(self.action.clone());
        } else {
            self.bar
                .set_message(format!("{} {}", self.action, self.target));
        }
    }

    /// Apply one signal; returns the outcome once the transaction ends
    pub fn apply(&mut self, signal: &Signal) -> Option<Finished> {
        match signal {
            Signal::Action(text) | Signal::ActionLong(text) => {
                self.action = text.clone();
                self.target.clear();
                self.refresh_message();
            }
            Signal::Target(text) => {
                self.target = text.clone();
                self.refresh_message();
            }
            Signal::Percent(percent) => {
                if (0.0..=1.0).contains(percent) {
                    if self.pulsing {
                        self.pulsing = false;
                        self.show_fraction();
                    }
                    self.bar.set_position((percent * BAR_LENGTH as f64) as u64);
                } else if !self.pulsing {
                    self.pulsing = true;
                    self.show_pulse();
                }
            }
            Signal::LogWarning(text) => {
                let _ = self.multi.println(format!("warning: {}", text));
            }
            Signal::LogError(text) => {
                let _ = self.multi.println(format!("error: {}", text));
            }
            Signal::TransactionStart => {
                self.bar.reset();
            }
            Signal::TransactionDone(message) => {
                self.bar.finish_with_message(message.clone());
                return Some(Finished::Done(message.clone()));
            }
            Signal::TransactionError(message) => {
                self.bar.abandon_with_message(message.clone());
                return Some(Finished::Failed(message.clone()));
            }
            Signal::Icon(_) | Signal::NeedDetails(_) | Signal::AvailableUpdates(_) => {}
        }
        None
    }

    /// Draw signals until the transaction ends or the stream closes
    pub async fn follow(mut self, mut signals: broadcast::Receiver<Signal>) -> Option<Finished> {
        loop {
            match signals.recv().await {
                Ok(signal) => {
                    if let Some(finished) = self.apply(&signal) {
                        return Some(finished);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.bar.finish_and_clear();
                    return None;
                }
            }
        }
    }
}

impl Default for SignalRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// One line per package for the confirmation summary
pub fn package_line(name: &str, version: &str, download_size: Option<u64>) -> String {
    match download_size {
        Some(size) if size > 0 => format!("  {:<32} {:<16} {}", name, version, format_size(size)),
        _ => format!("  {:<32} {}", name, version),
    }
}
