// 表达式渲染模块

pub mod coerce;
mod helpers;
mod renderer;

pub use renderer::{is_template, RenderScope, Renderer};
