pub mod config;
pub mod document;
pub mod frontmatter;
pub mod links;
