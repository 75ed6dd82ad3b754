use anyhow::{Context, Result};
use chrono::DateTime;
use crossterm::style::Stylize;
use graphtool::graph::list::{ImageFilters, ImageLister, ImageSummary, ListOptions, NamePattern};

use super::{format_bytes, Store};
use crate::config;

pub fn run(all: bool, filters: &[String], pattern: Option<&str>) -> Result<()> {
    let cfg = config::get();
    let options = ListOptions {
        all,
        filters: ImageFilters::parse(filters)?,
        pattern: pattern
            .map(NamePattern::parse)
            .transpose()
            .context("Invalid image pattern")?,
    };

    let store = Store::open(cfg)?;
    let images = ImageLister::new(&store.graph, &store.references).list(&options);

    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&images)?);
    } else {
        print_table(&images);
    }
    Ok(())
}

/// One line per repository tag, like `docker images`.
fn print_table(images: &[ImageSummary]) {
    let mut rows: Vec<[String; 5]> = Vec::new();
    for image in images {
        let created = DateTime::from_timestamp(image.created, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let size = format_bytes(image.virtual_size.max(0) as u64);

        let tags: Vec<(&str, &str)> = if image.repo_tags.is_empty() {
            vec![("<none>", "<none>")]
        } else {
            image
                .repo_tags
                .iter()
                .map(|t| t.rsplit_once(':').unwrap_or((t.as_str(), "<none>")))
                .collect()
        };

        for (repository, tag) in tags {
            rows.push([
                repository.to_string(),
                tag.to_string(),
                image.id.short().to_string(),
                created.clone(),
                size.clone(),
            ]);
        }
    }

    let header = ["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: [&str; 5]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("   ")
            .trim_end()
            .to_string()
    };

    println!("{}", line(header).bold());
    for row in &rows {
        println!("{}", line(row.each_ref().map(String::as_str)));
    }
}
