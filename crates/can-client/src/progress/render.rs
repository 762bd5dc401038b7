//! Terminal rendering of image-fetch progress.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crossterm::cursor::{MoveToColumn, MoveUp};
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{FetchProgress, FetchStatus, ProgressRenderer};

/// Default redraw interval.
pub const DEFAULT_REFRESH: Duration = Duration::from_millis(100);

/// Redraws one line per image fetch in place.
///
/// When created inside a tokio runtime a background task redraws every
/// `refresh` interval; otherwise each update is drawn immediately.
pub struct TerminalRenderer {
    state: Arc<Mutex<RenderState>>,
    ticker: Option<JoinHandle<()>>,
}

struct RenderState {
    out: Box<dyn Write + Send>,
    fetches: Vec<FetchProgress>,
    drawn_lines: usize,
    dirty: bool,
    finished: bool,
}

impl TerminalRenderer {
    /// Render to stderr at the default cadence.
    pub fn stderr() -> Self {
        Self::new(io::stderr(), DEFAULT_REFRESH)
    }

    pub fn new<W: Write + Send + 'static>(out: W, refresh: Duration) -> Self {
        let state = Arc::new(Mutex::new(RenderState {
            out: Box::new(out),
            fetches: Vec::new(),
            drawn_lines: 0,
            dirty: false,
            finished: false,
        }));

        let ticker = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let state = Arc::clone(&state);
            handle.spawn(async move {
                let mut interval = tokio::time::interval(refresh);
                loop {
                    interval.tick().await;
                    let mut guard = lock(&state);
                    if guard.finished {
                        break;
                    }
                    if guard.dirty {
                        guard.redraw();
                    }
                }
            })
        });

        Self { state, ticker }
    }

    /// Snapshot of the fetches currently shown, in display order.
    pub fn fetches(&self) -> Vec<FetchProgress> {
        lock(&self.state).fetches.clone()
    }
}

impl ProgressRenderer for TerminalRenderer {
    fn update(&mut self, fetches: Vec<FetchProgress>) {
        let mut state = lock(&self.state);
        for fetch in fetches {
            match state.fetches.iter_mut().find(|f| f.key() == fetch.key()) {
                Some(existing) => *existing = fetch,
                None => state.fetches.push(fetch),
            }
        }
        state.dirty = true;
        if self.ticker.is_none() {
            state.redraw();
        }
    }

    fn done(&mut self) {
        let mut state = lock(&self.state);
        state.redraw();
        state.finished = true;
    }

    fn stop(&mut self) {
        lock(&self.state).finished = true;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for TerminalRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(state: &Mutex<RenderState>) -> MutexGuard<'_, RenderState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RenderState {
    fn redraw(&mut self) {
        self.dirty = false;
        if let Err(e) = self.draw(SystemTime::now()) {
            debug!(error = %e, "Failed to draw progress");
        }
    }

    fn draw(&mut self, now: SystemTime) -> io::Result<()> {
        if self.drawn_lines > 0 {
            let up = u16::try_from(self.drawn_lines).unwrap_or(u16::MAX);
            queue!(self.out, MoveUp(up))?;
        }
        let width = self.fetches.iter().map(|f| f.image.len()).max().unwrap_or(0);
        for fetch in &self.fetches {
            queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
            writeln!(self.out, "{}", format_line(fetch, width, now))?;
        }
        self.drawn_lines = self.fetches.len();
        self.out.flush()
    }
}

fn format_line(fetch: &FetchProgress, width: usize, now: SystemTime) -> String {
    let detail = match fetch.status {
        FetchStatus::Downloading if fetch.total > 0 => {
            format!("{} / {}", human_bytes(fetch.offset), human_bytes(fetch.total))
        }
        FetchStatus::Downloading => human_bytes(fetch.offset),
        _ if !fetch.resolved.is_empty() && fetch.status.is_finished() => {
            short_digest(&fetch.resolved).to_string()
        }
        _ => String::new(),
    };
    let elapsed = fetch
        .started_at
        .and_then(|started| now.duration_since(started).ok())
        .map(|d| format!("({:.1}s)", d.as_secs_f64()))
        .unwrap_or_default();

    format!(
        "{:<width$}  {:<11}  {detail} {elapsed}",
        fetch.image,
        fetch.status.label(),
    )
    .trim_end()
    .to_string()
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    hex.get(..12).unwrap_or(hex)
}

/// Format a byte count with binary units, e.g. `1.5 MiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedOut(Arc<Mutex<Vec<u8>>>);

    impl SharedOut {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedOut {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fetch(image: &str, status: FetchStatus, offset: u64, total: u64) -> FetchProgress {
        FetchProgress {
            container_id: "c1".into(),
            image: image.into(),
            resolved: String::new(),
            status,
            offset,
            total,
            started_at: None,
        }
    }

    #[test]
    fn human_bytes_picks_binary_units() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn downloading_line_shows_counters_and_elapsed() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let mut f = fetch("busybox", FetchStatus::Downloading, 1024, 4096);
        f.started_at = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(98));

        let line = format_line(&f, 10, now);
        assert_eq!(line, "busybox     downloading  1.0 KiB / 4.0 KiB (2.0s)");
    }

    #[test]
    fn finished_line_shows_short_digest() {
        let mut f = fetch("nginx", FetchStatus::Done, 0, 0);
        f.resolved = "sha256:0123456789abcdef0123".into();

        let line = format_line(&f, 5, SystemTime::UNIX_EPOCH);
        assert_eq!(line, "nginx  done         0123456789ab");
    }

    #[test]
    fn updates_merge_by_fetch_identity() {
        let out = SharedOut::default();
        let mut renderer = TerminalRenderer::new(out.clone(), DEFAULT_REFRESH);

        renderer.update(vec![
            fetch("busybox", FetchStatus::Resolving, 0, 0),
            fetch("nginx", FetchStatus::Waiting, 0, 0),
        ]);
        renderer.update(vec![fetch("busybox", FetchStatus::Downloading, 10, 20)]);

        let shown = renderer.fetches();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].status, FetchStatus::Downloading);
        assert_eq!(shown[1].image, "nginx");

        renderer.done();
        renderer.stop();

        let text = out.text();
        assert!(text.contains("resolving"));
        assert!(text.contains("10 B / 20 B"));
        // Second and later frames move back over the previous one.
        assert!(text.contains("\u{1b}[2A"));
    }

    #[tokio::test]
    async fn ticker_redraws_pending_updates() {
        let out = SharedOut::default();
        let mut renderer = TerminalRenderer::new(out.clone(), Duration::from_millis(5));

        renderer.update(vec![fetch("alpine", FetchStatus::Exists, 0, 0)]);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !out.text().contains("alpine") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        renderer.stop();
        assert!(renderer.ticker.is_none());
    }
}
