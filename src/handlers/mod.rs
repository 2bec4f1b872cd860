pub mod dispatch;
pub mod health_handler;
pub mod logs_handler;
pub mod ws_handler;
