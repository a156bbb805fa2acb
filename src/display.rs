use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GestureOrigin {
    Local,
    Remote,
}

impl GestureOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            GestureOrigin::Local => "local",
            GestureOrigin::Remote => "remote",
        }
    }
}

#[derive(Clone, Debug, Default)]
struct BoardState {
    text: Option<String>,
    origin: Option<GestureOrigin>,
    updates: u64,
    last_frame: Option<(u32, u32)>,
}

/// The single gesture line shown to the user.
///
/// Locally classified gestures and gestures broadcast by other clients write
/// to the same line; the most recent one wins.
#[derive(Clone, Default)]
pub struct DisplayBoard {
    state: Arc<Mutex<BoardState>>,
}

impl DisplayBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show_gesture(&self, label: &str, origin: GestureOrigin) {
        let text = format!("Hand Sign: {label}");
        let mut state = self.state.lock();
        if state.text.as_deref() != Some(text.as_str()) {
            log::info!("[{}] {text}", origin.label());
        }
        state.text = Some(text);
        state.origin = Some(origin);
        state.updates += 1;
    }

    pub fn show_frame(&self, width: u32, height: u32) {
        self.state.lock().last_frame = Some((width, height));
    }

    pub fn text(&self) -> Option<String> {
        self.state.lock().text.clone()
    }

    pub fn origin(&self) -> Option<GestureOrigin> {
        self.state.lock().origin
    }

    pub fn updates(&self) -> u64 {
        self.state.lock().updates
    }

    pub fn last_frame(&self) -> Option<(u32, u32)> {
        self.state.lock().last_frame
    }
}
