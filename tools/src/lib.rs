pub mod handler;
pub mod worker;

pub use handler::{handle, HandlerError, MockWeather, ToolRequest, ToolResponse, WeatherSource};
pub use worker::{Outcome, Worker};
