/*
 * Responsibility
 * - middleware public surface
 */
pub mod http;
