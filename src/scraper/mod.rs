//! Scraper service: fetch, anti-blocking, cache, parse.

pub mod client;
pub mod parser;
pub mod pipeline;
pub mod routes;
pub mod urls;

pub use client::{HttpScraperClient, ProductKind, ProductScraper, ScrapedDetails, SharedScraper};
pub use pipeline::{HtmlFetcher, HttpFetcher, ScraperPipeline};
