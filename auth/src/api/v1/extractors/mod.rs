/*
 * Responsibility
 * - request extractors whose rejections use the AppError body
 */
mod json_body;

pub use json_body::JsonBody;
