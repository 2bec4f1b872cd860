pub mod clock_service;
pub mod layout_service;
pub mod midi_service;
pub mod recorder_service;
pub mod session_service;
