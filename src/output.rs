//! CSV output of completed presents.
//!
//! The writer owns the derived state the core deliberately does not track:
//! per-swapchain previous present and display times, and the pid-to-image
//! name mapping fed from process events.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::record::{PresentRecord, ProcessEvent};

/// Output column options.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Emit the display-tracking columns.
    pub track_display: bool,
    /// Emit the debug columns.
    pub track_debug: bool,
    /// Timestamp counter ticks per second.
    pub timestamp_frequency: u64,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            track_display: true,
            track_debug: false,
            timestamp_frequency: 10_000_000,
        }
    }
}

#[derive(Default, Clone, Copy)]
struct ChainState {
    last_present_time: u64,
    last_displayed_time: u64,
}

/// Streams completed presents as CSV rows.
pub struct CsvWriter<W: Write> {
    out: W,
    opts: CsvOptions,
    start_timestamp: Option<u64>,
    process_names: HashMap<u32, String>,
    chains: HashMap<(u32, u64), ChainState>,
}

impl<W: Write> CsvWriter<W> {
    /// Create the writer and emit the header row.
    pub fn new(mut out: W, opts: CsvOptions) -> io::Result<Self> {
        let mut header = String::from(
            "Application,ProcessID,SwapChainAddress,Runtime,SyncInterval,PresentFlags,\
             Dropped,TimeInSeconds,msBetweenPresents,msInPresentAPI",
        );
        if opts.track_display {
            header.push_str(
                ",AllowsTearing,PresentMode,msBetweenDisplayChange,\
                 msUntilRenderComplete,msUntilDisplayed",
            );
        }
        if opts.track_debug {
            header.push_str(",WasBatched,DwmNotified");
        }
        writeln!(out, "{header}")?;
        Ok(Self {
            out,
            opts,
            start_timestamp: None,
            process_names: HashMap::new(),
            chains: HashMap::new(),
        })
    }

    /// The timestamp all TimeInSeconds values are relative to. Set once from
    /// the session; defaults to the first present written.
    pub fn set_start_timestamp(&mut self, timestamp: u64) {
        if self.start_timestamp.is_none() {
            self.start_timestamp = Some(timestamp);
        }
    }

    /// Track image names from the process event stream.
    pub fn note_process_event(&mut self, event: &ProcessEvent) {
        if event.is_start && !event.image_name.is_empty() {
            self.process_names
                .insert(event.process_id, event.image_name.clone());
        }
    }

    fn ms(&self, ticks: u64) -> f64 {
        ticks as f64 * 1000.0 / self.opts.timestamp_frequency as f64
    }

    /// Emit one completed present.
    pub fn write_present(&mut self, p: &PresentRecord) -> io::Result<()> {
        self.set_start_timestamp(p.start_time);
        let start = self.start_timestamp.unwrap_or(p.start_time);

        let chain = self
            .chains
            .entry((p.process_id, p.swap_chain))
            .or_default();
        let between_presents = if chain.last_present_time != 0 {
            p.start_time.saturating_sub(chain.last_present_time)
        } else {
            0
        };
        let displayed = p.screen_time != 0 && !p.dropped();
        let between_display = if displayed && chain.last_displayed_time != 0 {
            p.screen_time.saturating_sub(chain.last_displayed_time)
        } else {
            0
        };
        chain.last_present_time = p.start_time;
        if displayed {
            chain.last_displayed_time = p.screen_time;
        }

        let application = self
            .process_names
            .get(&p.process_id)
            .cloned()
            .unwrap_or_else(|| "<unknown>".to_string());
        let time_in_seconds =
            p.start_time.saturating_sub(start) as f64 / self.opts.timestamp_frequency as f64;
        let ms_between_presents = self.ms(between_presents);
        let ms_in_present_api = self.ms(p.time_in_present);

        write!(
            self.out,
            "{},{},{:#x},{},{},{},{},{:.6},{:.6},{:.6}",
            application,
            p.process_id,
            p.swap_chain,
            p.runtime,
            p.sync_interval,
            p.present_flags,
            u8::from(p.dropped()),
            time_in_seconds,
            ms_between_presents,
            ms_in_present_api,
        )?;

        if self.opts.track_display {
            let between_display_ms = self.ms(between_display);
            let until_render = if p.ready_time != 0 {
                self.ms(p.ready_time.saturating_sub(p.start_time))
            } else {
                0.0
            };
            let until_displayed = if displayed {
                self.ms(p.screen_time.saturating_sub(p.start_time))
            } else {
                0.0
            };
            write!(
                self.out,
                ",{},{},{:.6},{:.6},{:.6}",
                u8::from(p.supports_tearing),
                p.mode,
                between_display_ms,
                until_render,
                until_displayed,
            )?;
        }

        if self.opts.track_debug {
            write!(
                self.out,
                ",{},{}",
                u8::from(p.was_batched()),
                u8::from(p.dwm_notified),
            )?;
        }

        writeln!(self.out)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
