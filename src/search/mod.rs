mod matcher;
mod query;

pub use query::{local_midnight, parse_query, QueryEngine, SearchQuery, SECONDS_PER_DAY};
