//! feedmerge - merge many RSS/Atom/JSON feeds into one
//!
//! Users sign in with a one-time code sent to their email address, build
//! named feeds out of source URLs, and read the merged result as HTML or
//! re-exported as RSS 2.0, Atom 1.0 or JSON Feed 1.1.

pub mod aggregator;
pub mod auth;
pub mod config;
pub mod convert;
pub mod db;
pub mod fetcher;
pub mod mailer;
pub mod model;
pub mod pending;
pub mod routes;
pub mod token;
