use std::io::Write;

use crate::gesture::GrabEvent;
use crate::session::SessionEvent;
use crate::state::ControllerState;
use crate::turn::DropReason;

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

pub fn status(state: ControllerState) {
    let line = match state {
        ControllerState::Listening => "\x1b[32m● Listening...\x1b[0m".to_string(),
        ControllerState::AwaitingLanguageDetection => {
            format!("\x1b[33m{} Detecting language...\x1b[0m", SPINNER[0])
        }
        ControllerState::AwaitingReply => format!("\x1b[33m{} Thinking...\x1b[0m", SPINNER[3]),
        ControllerState::Speaking => "\x1b[35m♪ Speaking...\x1b[0m".to_string(),
        ControllerState::CooldownBeforeResume => "\x1b[90m… Cooling down\x1b[0m".to_string(),
    };
    print!("\r\x1b[K{}", line);
    std::io::stdout().flush().ok();
}

pub fn clear_line() {
    print!("\r\x1b[K");
    std::io::stdout().flush().ok();
}

pub fn show_heard(text: &str) {
    print!("\r\x1b[K> {}\n", text);
    std::io::stdout().flush().ok();
}

pub fn show_reply(text: &str, language: &str) {
    print!("\r\x1b[K\x1b[36m[{}] {}\x1b[0m\n", language, text);
    std::io::stdout().flush().ok();
}

pub fn show_dropped(reason: DropReason) {
    let why = match reason {
        DropReason::Busy(_) => "busy",
        DropReason::Echo => "echo",
        DropReason::Blank => return,
    };
    print!("\r\x1b[K\x1b[90m(ignored: {})\x1b[0m\n", why);
    std::io::stdout().flush().ok();
}

pub fn show_grab(grab: &GrabEvent) {
    print!(
        "\r\x1b[K\x1b[1;33m✊ grab at ({:.0}, {:.0})\x1b[0m\n",
        grab.centroid.x, grab.centroid.y
    );
    std::io::stdout().flush().ok();
}

pub fn show_fist(frame: usize, closed: bool) {
    println!("{:>6}  {}", frame, if closed { "closed" } else { "open" });
}

/// Render one session event. Replies are printed by the playback backend.
pub fn render(event: &SessionEvent) {
    match event {
        SessionEvent::State(state) => status(*state),
        SessionEvent::Heard(text) => show_heard(text),
        SessionEvent::Replied { .. } => {}
        SessionEvent::Dropped(reason) => show_dropped(*reason),
    }
}
