//! Report Service - Exports CSV reports from the loaded charts database
//!
//! Reports:
//! - Top 10 tracks by total streams for a year
//! - Top 50 artists by number of distinct charting tracks
//! - Top 200 chart snapshot for one date and region
//!
//! Runs downstream of the loader and validator; it reads the store and
//! writes CSVs under $REPORT_DIR, never touching the loaded tables.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "report", about = "Exports CSV reports from the charts database")]
struct Args {
    /// Year for the top-tracks report
    #[arg(long, default_value_t = 2021)]
    year: i32,

    /// Chart date for the snapshot report (YYYY-MM-DD)
    #[arg(long, default_value = "2021-12-07")]
    chart_date: NaiveDate,

    /// Region id for the snapshot report
    #[arg(long, default_value_t = 66)]
    region_id: i32,
}

#[derive(Debug, Clone)]
struct Config {
    pg_host: String,
    pg_port: String,
    pg_db: String,
    pg_user: String,
    pg_pass: String,
    report_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            pg_host: std::env::var("PG_HOST").context("PG_HOST env var missing")?,
            pg_port: std::env::var("PG_PORT").unwrap_or_else(|_| "5432".to_string()),
            pg_db: std::env::var("PG_DB").context("PG_DB env var missing")?,
            pg_user: std::env::var("PG_USER").context("PG_USER env var missing")?,
            pg_pass: std::env::var("PG_PASS").context("PG_PASS env var missing")?,
            report_dir: PathBuf::from(
                std::env::var("REPORT_DIR").context("REPORT_DIR env var missing")?,
            ),
        })
    }

    fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.pg_user, self.pg_pass, self.pg_host, self.pg_port, self.pg_db
        )
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TopTrack {
    track_name: String,
    artist_name: String,
    total_streams: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct TopArtist {
    artist_name: String,
    unique_song_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    entry_id: i32,
    chart_date: NaiveDate,
    chart_position: i32,
    track_id: Option<i32>,
    artist_id: Option<i32>,
    track_name: Option<String>,
    artist_name: Option<String>,
    region_id: Option<i32>,
    country_name: Option<String>,
    streams: i64,
}

/// Half-open date range covering one calendar year; ranges prune the
/// yearly partitions where an EXTRACT() predicate would scan them all.
fn year_bounds(year: i32) -> Result<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1).context("Invalid report year")?;
    let end = NaiveDate::from_ymd_opt(year + 1, 1, 1).context("Invalid report year")?;
    Ok((start, end))
}

/// Top 10 tracks by total streams for a year.
async fn top_tracks(pool: &PgPool, year: i32) -> Result<Vec<TopTrack>> {
    let (start, end) = year_bounds(year)?;
    let rows = sqlx::query_as(
        r#"
        SELECT t.track_name,
               a.artist_name,
               SUM(c.streams)::BIGINT AS total_streams
        FROM chart_entries c
        JOIN tracks t ON c.track_id = t.track_id
        JOIN artists a ON t.artist_id = a.artist_id
        WHERE c.chart_date >= $1 AND c.chart_date < $2
        GROUP BY t.track_name, a.artist_name
        ORDER BY total_streams DESC
        LIMIT 10
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
    .context("Top tracks query failed")?;
    Ok(rows)
}

/// Artists with the most distinct charting tracks.
async fn top_artists(pool: &PgPool) -> Result<Vec<TopArtist>> {
    let rows = sqlx::query_as(
        r#"
        SELECT a.artist_name,
               COUNT(DISTINCT t.track_id) AS unique_song_count
        FROM artists a
        JOIN tracks t ON a.artist_id = t.artist_id
        GROUP BY a.artist_name
        ORDER BY unique_song_count DESC
        LIMIT 50
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Top artists query failed")?;
    Ok(rows)
}

/// Full top-200 chart for one date and region, dimension names joined in.
async fn chart_snapshot(pool: &PgPool, date: NaiveDate, region_id: i32) -> Result<Vec<SnapshotRow>> {
    let rows = sqlx::query_as(
        r#"
        SELECT c.entry_id,
               c.chart_date,
               c.chart_position,
               t.track_id,
               a.artist_id,
               t.track_name,
               a.artist_name,
               r.region_id,
               r.country_name,
               c.streams
        FROM chart_entries c
        LEFT JOIN tracks t ON c.track_id = t.track_id
        LEFT JOIN artists a ON c.artist_id = a.artist_id
        LEFT JOIN region r ON c.region_id = r.region_id
        WHERE c.chart_date = $1
          AND c.region_id = $2
        ORDER BY c.chart_position ASC
        LIMIT 200
        "#,
    )
    .bind(date)
    .bind(region_id)
    .fetch_all(pool)
    .await
    .context("Chart snapshot query failed")?;
    Ok(rows)
}

fn write_top_tracks_csv(path: &Path, rows: &[TopTrack]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["track_name", "artist_name", "total_streams"])?;
    for row in rows {
        let streams = group_thousands(row.total_streams);
        writer.write_record([row.track_name.as_str(), row.artist_name.as_str(), streams.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_top_artists_csv(path: &Path, rows: &[TopArtist]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Empty cell for a NULL joined column, matching how the dimension gaps
/// surface in the store after a skipped dimension load.
fn cell<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

fn write_snapshot_csv(path: &Path, rows: &[SnapshotRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record([
        "entry_id",
        "chart_date",
        "chart_position",
        "track_id",
        "artist_id",
        "track_name",
        "artist_name",
        "region_id",
        "country_name",
        "streams",
    ])?;
    for row in rows {
        writer.write_record([
            row.entry_id.to_string(),
            row.chart_date.to_string(),
            row.chart_position.to_string(),
            cell(&row.track_id),
            cell(&row.artist_id),
            cell(&row.track_name),
            cell(&row.artist_name),
            cell(&row.region_id),
            cell(&row.country_name),
            group_thousands(row.streams),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn group_thousands(n: i64) -> String {
    let digits = n.abs().to_string();
    let mut out = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if n < 0 {
        format!("-{}", out)
    } else {
        out
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Charts Reporting ===");
    std::fs::create_dir_all(&config.report_dir)
        .with_context(|| format!("Failed to create {}", config.report_dir.display()))?;

    println!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url())
        .await
        .context("Failed to connect to database")?;

    println!("Generating top tracks for {}...", args.year);
    let tracks = top_tracks(&pool, args.year).await?;
    let out = config
        .report_dir
        .join(format!("top_10_tracks_{}.csv", args.year));
    write_top_tracks_csv(&out, &tracks)?;
    println!("  Saved: {} ({} rows)", out.display(), tracks.len());

    println!("Generating top artists by unique songs...");
    let artists = top_artists(&pool).await?;
    let out = config.report_dir.join("top_50_artists_by_songs.csv");
    write_top_artists_csv(&out, &artists)?;
    println!("  Saved: {} ({} rows)", out.display(), artists.len());

    println!(
        "Generating chart for {} (region {})...",
        args.chart_date, args.region_id
    );
    let snapshot = chart_snapshot(&pool, args.chart_date, args.region_id).await?;
    let out = config.report_dir.join(format!(
        "top_200_{}_region{}.csv",
        args.chart_date, args.region_id
    ));
    write_snapshot_csv(&out, &snapshot)?;
    println!("  Saved: {} ({} rows)", out.display(), snapshot.len());

    println!("\nAll reports generated");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_bounds_half_open() {
        let (start, end) = year_bounds(2021).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2022, 1, 1).unwrap());
    }

    #[test]
    fn test_cell_renders_null_as_empty() {
        assert_eq!(cell(&None::<i32>), "");
        assert_eq!(cell(&Some(66)), "66");
        assert_eq!(cell(&Some("Argentina".to_string())), "Argentina");
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(1_000_000), "1,000,000");
        assert_eq!(group_thousands(987), "987");
    }

    #[test]
    fn test_top_tracks_csv_formats_streams() {
        let dir = std::env::temp_dir().join("charts_report_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("top_10_tracks_2021.csv");
        let rows = vec![TopTrack {
            track_name: "Dakiti".to_string(),
            artist_name: "Bad Bunny".to_string(),
            total_streams: 1_234_567,
        }];
        write_top_tracks_csv(&path, &rows).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("track_name,artist_name,total_streams\n"));
        assert!(text.contains("Dakiti,Bad Bunny,\"1,234,567\"\n"));
        std::fs::remove_file(&path).ok();
    }
}
