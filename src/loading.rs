//! Reference-counted loading indicator.
//!
//! Every `toggle(Some(true))` must be paired with a `toggle(Some(false))`; the
//! overlay stays visible while at least one request is outstanding.

use std::sync::Mutex;
use tracing::{debug, info};

/// Something that can be shown while work is pending.
pub trait Overlay {
    fn set_visible(&mut self, visible: bool);
    fn is_visible(&self) -> bool;
}

/// Overlay that only reports visibility changes to the log.
#[derive(Debug, Default)]
pub struct LogOverlay {
    visible: bool,
}

impl Overlay for LogOverlay {
    fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            info!("{}", if visible { "Loading..." } else { "Loading done" });
        }
        self.visible = visible;
    }

    fn is_visible(&self) -> bool {
        self.visible
    }
}

#[derive(Debug)]
pub struct LoadingIndicator<O> {
    count: usize,
    overlay: Option<O>,
}

impl<O> Default for LoadingIndicator<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> LoadingIndicator<O> {
    pub const fn new() -> Self {
        Self {
            count: 0,
            overlay: None,
        }
    }

    /// Outstanding show requests.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl<O: Overlay + Default> LoadingIndicator<O> {
    /// Shows (`Some(true)`), hides (`Some(false)`) or flips (`None`) the overlay.
    ///
    /// The overlay is created on first use.
    pub fn toggle(&mut self, show: Option<bool>) -> &O {
        let overlay = self.overlay.get_or_insert_with(O::default);
        let show = show.unwrap_or(!overlay.is_visible());

        if show {
            self.count += 1;
            overlay.set_visible(true);
        } else {
            self.count = self.count.saturating_sub(1);
            if self.count == 0 {
                overlay.set_visible(false);
            }
        }
        debug!("loading indicator count: {}", self.count);
        overlay
    }

    pub fn is_visible(&self) -> bool {
        self.overlay.as_ref().is_some_and(O::is_visible)
    }
}

static GLOBAL: Mutex<LoadingIndicator<LogOverlay>> = Mutex::new(LoadingIndicator::new());

/// Toggles the process-wide indicator and returns whether it is visible now.
pub fn toggle(show: Option<bool>) -> bool {
    let mut indicator = GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    indicator.toggle(show).is_visible()
}
