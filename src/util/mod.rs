pub mod buf;
pub mod rolling_window;
