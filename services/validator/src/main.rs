//! Validator Service - Cross-checks loaded chart data against source files
//!
//! Five independent checks, none of them mutating:
//! - Row-count parity between each source file and its table
//! - Foreign-key integrity of the fact table (orphan counts per reference)
//! - Null checks on chart_date, chart_position and streams
//! - Natural-key duplicate absence
//! - Random spot check of one source record against the store
//!
//! A failing check is a reported outcome, not an error: all five always run
//! and the process exits zero either way. Callers that need a hard gate must
//! inspect the printed verdict.

use anyhow::{Context, Result};
use arrow::array::{
    Array, Date32Array, Int32Array, Int64Array, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{Duration, NaiveDate};
use clap::Parser;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "validator", about = "Validates loaded chart data against the source files")]
struct Args {
    /// Input directory with the normalized split files (default: $DATA_DIR/splits)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Config {
    pg_host: String,
    pg_port: String,
    pg_db: String,
    pg_user: String,
    pg_pass: String,
    data_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            pg_host: std::env::var("PG_HOST").context("PG_HOST env var missing")?,
            pg_port: std::env::var("PG_PORT").unwrap_or_else(|_| "5432".to_string()),
            pg_db: std::env::var("PG_DB").context("PG_DB env var missing")?,
            pg_user: std::env::var("PG_USER").context("PG_USER env var missing")?,
            pg_pass: std::env::var("PG_PASS").context("PG_PASS env var missing")?,
            data_dir: PathBuf::from(std::env::var("DATA_DIR").context("DATA_DIR env var missing")?),
        })
    }

    fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.pg_user, self.pg_pass, self.pg_host, self.pg_port, self.pg_db
        )
    }

    fn splits_dir(&self) -> PathBuf {
        self.data_dir.join("splits")
    }
}

/// One normalized chart entry from the fact dataset.
#[derive(Debug, Clone, PartialEq)]
struct FactRow {
    entry_id: i64,
    artist_id: i64,
    track_id: i64,
    region_id: i64,
    chart_date: NaiveDate,
    chart_position: i64,
    streams: i64,
}

/// Prefers the deduplicated artifact the loader writes; falls back to the
/// original file when no clean version exists yet.
fn resolve_fact_file(splits_dir: &Path) -> PathBuf {
    let clean = splits_dir.join("chart_entries_normalized_clean.parquet");
    if clean.exists() {
        return clean;
    }
    eprintln!("Warning: Using original fact file (no clean version found)");
    eprintln!("Run the loader first to create the clean version\n");
    splits_dir.join("chart_entries_normalized.parquet")
}

/// Source files in the loader's table order.
fn table_files(splits_dir: &Path) -> Vec<(&'static str, PathBuf)> {
    vec![
        ("artists", splits_dir.join("artists.csv")),
        ("tracks", splits_dir.join("tracks.csv")),
        ("region", splits_dir.join("region.csv")),
        ("chart_entries", resolve_fact_file(splits_dir)),
    ]
}

// =============================================================================
// Source file access
// =============================================================================

/// Row count without materializing the file: parquet answers from its
/// footer metadata, CSV counts lines minus the header.
fn count_file_rows(path: &Path) -> Result<i64> {
    if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
        let file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .context("Failed to read parquet metadata")?;
        return Ok(builder.metadata().file_metadata().num_rows());
    }

    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut lines: i64 = 0;
    for line in BufReader::new(file).lines() {
        line.with_context(|| format!("Failed to read {}", path.display()))?;
        lines += 1;
    }
    Ok((lines - 1).max(0))
}

/// 1970-01-01, day zero of the Date32 encoding.
fn unix_epoch() -> NaiveDate {
    NaiveDate::default()
}

fn int_values(batch: &RecordBatch, name: &str) -> Result<Vec<i64>> {
    let col = batch
        .column_by_name(name)
        .with_context(|| format!("Column '{}' missing from fact dataset", name))?;
    if col.null_count() > 0 {
        anyhow::bail!("Column '{}' contains nulls", name);
    }
    match col.data_type() {
        DataType::Int64 => Ok(col
            .as_any()
            .downcast_ref::<Int64Array>()
            .with_context(|| format!("Column '{}' is not Int64", name))?
            .values()
            .to_vec()),
        DataType::Int32 => Ok(col
            .as_any()
            .downcast_ref::<Int32Array>()
            .with_context(|| format!("Column '{}' is not Int32", name))?
            .values()
            .iter()
            .map(|v| *v as i64)
            .collect()),
        other => anyhow::bail!("Column '{}' has unsupported type {:?}", name, other),
    }
}

/// Date column truncated to day precision, the same truncation the loader
/// applies before it writes, so the spot check queries the store with the
/// value the store was loaded with.
fn date_values(batch: &RecordBatch, name: &str) -> Result<Vec<NaiveDate>> {
    let col = batch
        .column_by_name(name)
        .with_context(|| format!("Column '{}' missing from fact dataset", name))?;
    if col.null_count() > 0 {
        anyhow::bail!("Column '{}' contains nulls", name);
    }
    let epoch = unix_epoch();
    match col.data_type() {
        DataType::Date32 => Ok(col
            .as_any()
            .downcast_ref::<Date32Array>()
            .with_context(|| format!("Column '{}' is not Date32", name))?
            .values()
            .iter()
            .map(|days| epoch + Duration::days(*days as i64))
            .collect()),
        DataType::Timestamp(unit, _) => {
            let per_day: i64 = match unit {
                TimeUnit::Second => 86_400,
                TimeUnit::Millisecond => 86_400_000,
                TimeUnit::Microsecond => 86_400_000_000,
                TimeUnit::Nanosecond => 86_400_000_000_000,
            };
            let raw: Vec<i64> = match unit {
                TimeUnit::Second => col
                    .as_any()
                    .downcast_ref::<TimestampSecondArray>()
                    .with_context(|| format!("Column '{}' is not Timestamp(s)", name))?
                    .values()
                    .to_vec(),
                TimeUnit::Millisecond => col
                    .as_any()
                    .downcast_ref::<TimestampMillisecondArray>()
                    .with_context(|| format!("Column '{}' is not Timestamp(ms)", name))?
                    .values()
                    .to_vec(),
                TimeUnit::Microsecond => col
                    .as_any()
                    .downcast_ref::<TimestampMicrosecondArray>()
                    .with_context(|| format!("Column '{}' is not Timestamp(us)", name))?
                    .values()
                    .to_vec(),
                TimeUnit::Nanosecond => col
                    .as_any()
                    .downcast_ref::<TimestampNanosecondArray>()
                    .with_context(|| format!("Column '{}' is not Timestamp(ns)", name))?
                    .values()
                    .to_vec(),
            };
            Ok(raw
                .iter()
                .map(|v| epoch + Duration::days(v.div_euclid(per_day)))
                .collect())
        }
        other => anyhow::bail!("Column '{}' has unsupported date type {:?}", name, other),
    }
}

fn read_fact_parquet(path: &Path) -> Result<Vec<FactRow>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open fact dataset {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("Failed to read parquet metadata")?;
    let reader = builder.build().context("Failed to build parquet reader")?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context("Failed to decode parquet batch")?;
        let entry_ids = int_values(&batch, "entry_id")?;
        let artist_ids = int_values(&batch, "artist_id")?;
        let track_ids = int_values(&batch, "track_id")?;
        let region_ids = int_values(&batch, "region_id")?;
        let chart_dates = date_values(&batch, "chart_date")?;
        let chart_positions = int_values(&batch, "chart_position")?;
        let streams = int_values(&batch, "streams")?;
        for i in 0..batch.num_rows() {
            rows.push(FactRow {
                entry_id: entry_ids[i],
                artist_id: artist_ids[i],
                track_id: track_ids[i],
                region_id: region_ids[i],
                chart_date: chart_dates[i],
                chart_position: chart_positions[i],
                streams: streams[i],
            });
        }
    }
    Ok(rows)
}

// =============================================================================
// Checks
// =============================================================================

async fn check_row_counts(pool: &PgPool, files: &[(&str, PathBuf)]) -> Result<bool> {
    println!("\nRow counts:");
    let mut all_match = true;

    for (table, path) in files {
        let file_count = count_file_rows(path)?;
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let db_count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
        let ok = file_count == db_count;
        all_match = all_match && ok;

        if ok {
            println!("  {:<15} ✓", table);
        } else {
            println!(
                "  {:<15} ✗ (file: {}, db: {})",
                table,
                group_thousands(file_count),
                group_thousands(db_count)
            );
        }
    }
    Ok(all_match)
}

const FK_CHECKS: &[(&str, &str)] = &[
    ("artist_id", "artists"),
    ("track_id", "tracks"),
    ("region_id", "region"),
];

/// Anti-join counting fact rows whose referenced dimension key is absent.
fn orphan_count_sql(column: &str, ref_table: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM chart_entries ce \
         LEFT JOIN {} t ON ce.{} = t.{} \
         WHERE t.{} IS NULL",
        ref_table, column, column, column
    )
}

async fn check_foreign_keys(pool: &PgPool) -> Result<bool> {
    println!("\nForeign key integrity:");
    let mut all_ok = true;

    for (column, ref_table) in FK_CHECKS {
        let sql = orphan_count_sql(column, ref_table);
        let missing: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
        all_ok = all_ok && missing == 0;

        if missing == 0 {
            println!("  {:<15} ✓", column);
        } else {
            println!("  {:<15} ✗ {} orphaned", column, group_thousands(missing));
        }
    }
    Ok(all_ok)
}

const NULL_COUNT_SQL: &str = "SELECT COUNT(*) FROM chart_entries \
    WHERE chart_date IS NULL OR chart_position IS NULL OR streams IS NULL";

async fn check_nulls(pool: &PgPool) -> Result<bool> {
    println!("\nNull checks:");
    let nulls: i64 = sqlx::query_scalar(NULL_COUNT_SQL).fetch_one(pool).await?;
    if nulls == 0 {
        println!("  critical fields ✓");
    } else {
        println!("  critical fields ✗ {} null values", group_thousands(nulls));
    }
    Ok(nulls == 0)
}

const DUPLICATE_GROUPS_SQL: &str = "SELECT COUNT(*) FROM ( \
    SELECT artist_id, track_id, region_id, chart_position, chart_date \
    FROM chart_entries \
    GROUP BY artist_id, track_id, region_id, chart_position, chart_date \
    HAVING COUNT(*) > 1 \
    ) dup";

const DUPLICATE_SAMPLE_SQL: &str = "SELECT artist_id, track_id, region_id, \
    chart_position, chart_date, COUNT(*) AS cnt \
    FROM chart_entries \
    GROUP BY artist_id, track_id, region_id, chart_position, chart_date \
    HAVING COUNT(*) > 1 \
    LIMIT 3";

async fn check_duplicates(pool: &PgPool) -> Result<bool> {
    println!("\nDuplicate checks:");
    let dup_groups: i64 = sqlx::query_scalar(DUPLICATE_GROUPS_SQL)
        .fetch_one(pool)
        .await?;

    if dup_groups > 0 {
        println!(
            "  chart entries   ✗ {} duplicated keys",
            group_thousands(dup_groups)
        );
        let samples: Vec<(i32, i32, i32, i32, NaiveDate, i64)> =
            sqlx::query_as(DUPLICATE_SAMPLE_SQL).fetch_all(pool).await?;
        println!("  Examples:");
        for (artist, track, region, position, date, count) in samples {
            println!(
                "    artist={}, track={}, region={}, chart_position={}, date={} (x{})",
                artist, track, region, position, date, count
            );
        }
    } else {
        println!("  chart entries   ✓");
    }
    Ok(dup_groups == 0)
}

const SPOT_CHECK_SQL: &str = "SELECT artist_id FROM chart_entries \
    WHERE artist_id = $1 AND track_id = $2 AND region_id = $3 \
      AND chart_position = $4 AND chart_date = $5 \
    LIMIT 1";

/// Draws one source row uniformly at random and looks it up in the store
/// by natural key plus day-precision date.
async fn spot_check(pool: &PgPool, fact_path: &Path) -> Result<bool> {
    println!("\nSpot check:");
    let rows = read_fact_parquet(fact_path)?;
    println!(
        "  Fact columns: entry_id, artist_id, track_id, region_id, chart_date, \
         chart_position, streams"
    );
    if rows.is_empty() {
        println!("  random record   ✗ fact dataset is empty");
        return Ok(false);
    }

    let mut rng = rand::rng();
    let sample = &rows[rng.random_range(0..rows.len())];
    println!(
        "  sample record: entry={}, artist={}, track={}, region={}, date={}, \
         chart_position={}, streams={}",
        sample.entry_id,
        sample.artist_id,
        sample.track_id,
        sample.region_id,
        sample.chart_date,
        sample.chart_position,
        sample.streams
    );

    let found: Option<(i32,)> = sqlx::query_as(SPOT_CHECK_SQL)
        .bind(sample.artist_id)
        .bind(sample.track_id)
        .bind(sample.region_id)
        .bind(sample.chart_position)
        .bind(sample.chart_date)
        .fetch_optional(pool)
        .await?;

    if found.is_some() {
        println!("  random record   ✓ found in DB");
        Ok(true)
    } else {
        println!("  random record   ✗ not found in DB");
        Ok(false)
    }
}

/// A check whose queries error is reported as failed; it must not stop the
/// remaining checks from running.
fn run_check(name: &str, result: Result<bool>) -> bool {
    match result {
        Ok(passed) => passed,
        Err(e) => {
            eprintln!("  {} check errored: {:#}", name, e);
            false
        }
    }
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
    let splits_dir = args.data_dir.clone().unwrap_or_else(|| config.splits_dir());

    println!("\n{}", "=".repeat(50));
    println!("Charts Data Validation");
    println!("{}", "=".repeat(50));
    println!("Input dir: {}", splits_dir.display());

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url())
        .await
        .context("Failed to connect to database")?;

    let files = table_files(&splits_dir);
    let fact_path = files[files.len() - 1].1.clone();

    let mut checks: Vec<(&str, bool)> = Vec::new();
    checks.push((
        "Row counts",
        run_check("Row counts", check_row_counts(&pool, &files).await),
    ));
    checks.push((
        "Foreign keys",
        run_check("Foreign keys", check_foreign_keys(&pool).await),
    ));
    checks.push(("Null values", run_check("Null values", check_nulls(&pool).await)));
    checks.push((
        "Duplicates",
        run_check("Duplicates", check_duplicates(&pool).await),
    ));
    checks.push((
        "Spot check",
        run_check("Spot check", spot_check(&pool, &fact_path).await),
    ));

    println!("\n{}", "=".repeat(50));
    println!("Summary:");
    let all_passed = checks.iter().all(|(_, passed)| *passed);
    for (name, passed) in &checks {
        println!("  {:<15} {}", name, if *passed { "PASS" } else { "FAIL" });
    }

    println!(
        "\n{}",
        if all_passed {
            "All validations passed!"
        } else {
            "Some validations failed."
        }
    );
    println!("{}", "=".repeat(50));

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    // -------------------------------------------------------------------------
    // SOURCE FILE COUNTING
    // -------------------------------------------------------------------------

    #[test]
    fn test_count_csv_rows_excludes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artists.csv");
        fs::write(&path, "artist_id,artist_name\n1,Shakira\n2,Bad Bunny\n").unwrap();
        assert_eq!(count_file_rows(&path).unwrap(), 2);
    }

    #[test]
    fn test_count_csv_rows_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        fs::write(&path, "").unwrap();
        assert_eq!(count_file_rows(&path).unwrap(), 0);
    }

    #[test]
    fn test_count_csv_rows_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.csv");
        fs::write(&path, "region_id,country_name\n").unwrap();
        assert_eq!(count_file_rows(&path).unwrap(), 0);
    }

    #[test]
    fn test_count_missing_file_is_error() {
        assert!(count_file_rows(Path::new("/nonexistent/artists.csv")).is_err());
    }

    // -------------------------------------------------------------------------
    // FACT FILE RESOLUTION
    // -------------------------------------------------------------------------

    #[test]
    fn test_resolve_fact_file_prefers_clean_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let clean = dir.path().join("chart_entries_normalized_clean.parquet");
        fs::write(&clean, b"stub").unwrap();
        assert_eq!(resolve_fact_file(dir.path()), clean);
    }

    #[test]
    fn test_resolve_fact_file_falls_back_to_original() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_fact_file(dir.path()),
            dir.path().join("chart_entries_normalized.parquet")
        );
    }

    #[test]
    fn test_table_files_order_matches_loader() {
        let dir = tempfile::tempdir().unwrap();
        let tables: Vec<&str> = table_files(dir.path()).iter().map(|(t, _)| *t).collect();
        assert_eq!(tables, vec!["artists", "tracks", "region", "chart_entries"]);
    }

    // -------------------------------------------------------------------------
    // CHECK SQL SHAPES
    // -------------------------------------------------------------------------

    #[test]
    fn test_orphan_count_sql_is_an_anti_join() {
        let sql = orphan_count_sql("artist_id", "artists");
        assert!(sql.contains("LEFT JOIN artists t ON ce.artist_id = t.artist_id"));
        assert!(sql.contains("WHERE t.artist_id IS NULL"));
    }

    #[test]
    fn test_fk_checks_cover_all_references() {
        let columns: Vec<&str> = FK_CHECKS.iter().map(|(c, _)| *c).collect();
        assert_eq!(columns, vec!["artist_id", "track_id", "region_id"]);
    }

    #[test]
    fn test_duplicate_sql_groups_by_natural_key() {
        for sql in [DUPLICATE_GROUPS_SQL, DUPLICATE_SAMPLE_SQL] {
            assert!(sql.contains(
                "GROUP BY artist_id, track_id, region_id, chart_position, chart_date"
            ));
            assert!(sql.contains("HAVING COUNT(*) > 1"));
        }
        assert!(DUPLICATE_SAMPLE_SQL.contains("LIMIT 3"));
    }

    #[test]
    fn test_spot_check_sql_matches_natural_key_plus_date() {
        for predicate in [
            "artist_id = $1",
            "track_id = $2",
            "region_id = $3",
            "chart_position = $4",
            "chart_date = $5",
        ] {
            assert!(SPOT_CHECK_SQL.contains(predicate));
        }
    }

    #[test]
    fn test_null_sql_covers_critical_fields() {
        assert!(NULL_COUNT_SQL.contains("chart_date IS NULL"));
        assert!(NULL_COUNT_SQL.contains("chart_position IS NULL"));
        assert!(NULL_COUNT_SQL.contains("streams IS NULL"));
    }

    // -------------------------------------------------------------------------
    // CHECK INDEPENDENCE
    // -------------------------------------------------------------------------

    #[test]
    fn test_run_check_maps_errors_to_failure() {
        assert!(run_check("ok", Ok(true)));
        assert!(!run_check("failed", Ok(false)));
        assert!(!run_check("errored", Err(anyhow::anyhow!("connection lost"))));
    }

    // -------------------------------------------------------------------------
    // MISC
    // -------------------------------------------------------------------------

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(26_173_514), "26,173,514");
    }
}
