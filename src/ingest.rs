use duckdb::{Connection, params};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::common::{quote_ident, sql_escape_path};
use crate::constants::*;
use crate::error::{PipelineError, Result, UnavailableReason};
use crate::model::{
    PaymentRecord, PrescriptionRecord, ProviderType, ReportingPeriod, RosterEntry, SourceKind,
};

/// Where a table is read from: a CSV/Parquet file, or `<warehouse.duckdb>::<table>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    File(PathBuf),
    Table { database: PathBuf, table: String },
}

impl FromStr for SourceLocator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty source locator".to_string());
        }
        match trimmed.rsplit_once("::") {
            Some((database, table)) => {
                if database.is_empty() || table.is_empty() {
                    return Err(format!(
                        "invalid table locator `{trimmed}`; expected <database>::<table>"
                    ));
                }
                Ok(Self::Table {
                    database: PathBuf::from(database),
                    table: table.to_string(),
                })
            }
            None => Ok(Self::File(PathBuf::from(trimmed))),
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Table { database, table } => write!(f, "{}::{table}", database.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Numeric,
    Date,
}

#[derive(Debug, Clone)]
struct ResolvedColumn {
    name: String,
    data_type: String,
}

fn is_numeric_type(data_type: &str) -> bool {
    let upper = data_type.to_ascii_uppercase();
    [
        "TINYINT", "SMALLINT", "INTEGER", "BIGINT", "HUGEINT", "UTINYINT", "USMALLINT",
        "UINTEGER", "UBIGINT", "UHUGEINT", "FLOAT", "DOUBLE", "REAL", "DECIMAL", "NUMERIC",
    ]
    .iter()
    .any(|prefix| upper.starts_with(prefix))
}

fn is_fractional_type(data_type: &str) -> bool {
    let upper = data_type.to_ascii_uppercase();
    ["FLOAT", "DOUBLE", "REAL", "DECIMAL", "NUMERIC"]
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

struct OpenSource {
    source_kind: SourceKind,
    conn: Connection,
    columns: Vec<(String, String)>,
}

impl OpenSource {
    fn find(&self, aliases: &[&str]) -> Option<ResolvedColumn> {
        aliases.iter().find_map(|alias| {
            self.columns
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(alias))
                .map(|(name, data_type)| ResolvedColumn {
                    name: name.clone(),
                    data_type: data_type.clone(),
                })
        })
    }

    fn require(&self, aliases: &[&str], kind: ColumnKind) -> Result<ResolvedColumn> {
        let Some(col) = self.find(aliases) else {
            return Err(PipelineError::SchemaMismatch {
                source_kind: self.source_kind,
                column: aliases[0].to_string(),
                detail: format!(
                    "required column missing (accepted names: {})",
                    aliases.join(", ")
                ),
            });
        };
        if kind == ColumnKind::Numeric && !is_numeric_type(&col.data_type) {
            return Err(PipelineError::SchemaMismatch {
                source_kind: self.source_kind,
                column: col.name,
                detail: format!("expected a numeric type, found {}", col.data_type),
            });
        }
        Ok(col)
    }

    /// Optional columns are never type-checked; their values go through TRY_CAST.
    fn optional(&self, aliases: &[&str]) -> Option<ResolvedColumn> {
        self.find(aliases)
    }

    fn query_failed(&self) -> impl Fn(duckdb::Error) -> PipelineError {
        let source_kind = self.source_kind;
        move |err| query_failed(source_kind, err)
    }
}

fn query_failed(source_kind: SourceKind, err: impl fmt::Display) -> PipelineError {
    PipelineError::unavailable(source_kind, UnavailableReason::QueryFailed(err.to_string()))
}

fn text_expr(col: Option<&ResolvedColumn>) -> String {
    match col {
        Some(c) => format!("NULLIF(TRIM(CAST({} AS VARCHAR)), '')", quote_ident(&c.name)),
        None => "CAST(NULL AS VARCHAR)".to_string(),
    }
}

fn double_expr(col: Option<&ResolvedColumn>) -> String {
    match col {
        Some(c) => format!("TRY_CAST({} AS DOUBLE)", quote_ident(&c.name)),
        None => "CAST(NULL AS DOUBLE)".to_string(),
    }
}

fn bigint_expr(col: Option<&ResolvedColumn>) -> String {
    match col {
        Some(c) => format!("TRY_CAST({} AS BIGINT)", quote_ident(&c.name)),
        None => "CAST(NULL AS BIGINT)".to_string(),
    }
}

/// NPIs stored as floating point would stringify as `1234567893.0`; route them through BIGINT.
fn npi_expr(col: &ResolvedColumn) -> String {
    let ident = quote_ident(&col.name);
    if is_fractional_type(&col.data_type) {
        format!("CAST(TRY_CAST({ident} AS BIGINT) AS VARCHAR)")
    } else {
        format!("TRIM(CAST({ident} AS VARCHAR))")
    }
}

fn file_source_expr(path: &Path) -> std::result::Result<String, String> {
    let escaped = sql_escape_path(path);
    let name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if name.ends_with(".parquet") {
        Ok(format!("read_parquet('{escaped}')"))
    } else if name.ends_with(".csv") || name.ends_with(".csv.gz") || name.ends_with(".txt") {
        Ok(format!("read_csv_auto('{escaped}', header=true)"))
    } else {
        Err(format!(
            "Unsupported input extension for {}. Use .csv or .parquet",
            path.display()
        ))
    }
}

fn warehouse_table_expr(
    conn: &Connection,
    source_kind: SourceKind,
    database: &Path,
    table: &str,
) -> Result<String> {
    conn.execute(
        &format!(
            "ATTACH '{}' AS warehouse (READ_ONLY)",
            sql_escape_path(database)
        ),
        [],
    )
    .map_err(|err| query_failed(source_kind, err))?;

    let mut stmt = conn
        .prepare(
            r#"
            SELECT table_schema
            FROM information_schema.tables
            WHERE table_catalog = 'warehouse' AND table_name = ?
            ORDER BY table_schema
            LIMIT 1
        "#,
        )
        .map_err(|err| query_failed(source_kind, err))?;
    let schemas = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))
        .map_err(|err| query_failed(source_kind, err))?
        .collect::<duckdb::Result<Vec<String>>>()
        .map_err(|err| query_failed(source_kind, err))?;
    let Some(schema) = schemas.into_iter().next() else {
        return Err(PipelineError::unavailable(
            source_kind,
            UnavailableReason::Missing(format!("table {table} in {}", database.display())),
        ));
    };
    Ok(format!(
        "warehouse.{}.{}",
        quote_ident(&schema),
        quote_ident(table)
    ))
}

fn open_source(locator: &SourceLocator, source_kind: SourceKind) -> Result<OpenSource> {
    let existing = match locator {
        SourceLocator::File(path) | SourceLocator::Table { database: path, .. } => path,
    };
    let metadata = fs::metadata(existing).map_err(|_| {
        PipelineError::unavailable(
            source_kind,
            UnavailableReason::Missing(existing.display().to_string()),
        )
    })?;
    if metadata.is_file() && metadata.len() == 0 {
        return Err(PipelineError::unavailable(
            source_kind,
            UnavailableReason::Empty,
        ));
    }

    let conn = Connection::open_in_memory().map_err(|err| query_failed(source_kind, err))?;
    let source = match locator {
        SourceLocator::File(path) => {
            file_source_expr(path).map_err(|msg| query_failed(source_kind, msg))?
        }
        SourceLocator::Table { database, table } => {
            warehouse_table_expr(&conn, source_kind, database, table)?
        }
    };
    conn.execute(&format!("CREATE OR REPLACE VIEW src AS SELECT * FROM {source}"), [])
        .map_err(|err| query_failed(source_kind, err))?;

    let row_count: i64 = conn
        .prepare("SELECT COUNT(*)::BIGINT FROM src")
        .and_then(|mut stmt| stmt.query_row([], |row| row.get(0)))
        .map_err(|err| query_failed(source_kind, err))?;
    if row_count == 0 {
        return Err(PipelineError::unavailable(
            source_kind,
            UnavailableReason::Empty,
        ));
    }

    let columns = {
        let mut stmt = conn
            .prepare("SELECT name, type FROM pragma_table_info('src') ORDER BY cid")
            .map_err(|err| query_failed(source_kind, err))?;
        stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|err| query_failed(source_kind, err))?
            .collect::<duckdb::Result<Vec<(String, String)>>>()
            .map_err(|err| query_failed(source_kind, err))?
    };
    tracing::debug!(
        "{source_kind}: {row_count} rows, columns [{}]",
        columns
            .iter()
            .map(|(n, t)| format!("{n}:{t}"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(OpenSource {
        source_kind,
        conn,
        columns,
    })
}

fn ensure_rows_in_period<T>(source_kind: SourceKind, rows: Vec<T>) -> Result<Vec<T>> {
    if rows.is_empty() {
        Err(PipelineError::unavailable(
            source_kind,
            UnavailableReason::NoRowsInPeriod,
        ))
    } else {
        Ok(rows)
    }
}

pub fn load_roster(locator: &SourceLocator) -> Result<Vec<RosterEntry>> {
    let src = open_source(locator, SourceKind::Roster)?;
    let npi = src.require(ROSTER_NPI, ColumnKind::Text)?;
    let name = src.optional(ROSTER_NAME);
    let specialty = src.optional(ROSTER_SPECIALTY);
    let provider_type = src.optional(ROSTER_PROVIDER_TYPE);

    let sql = format!(
        "SELECT {}, {}, {}, {} FROM src",
        npi_expr(&npi),
        text_expr(name.as_ref()),
        text_expr(specialty.as_ref()),
        text_expr(provider_type.as_ref()),
    );
    let mut stmt = src.conn.prepare(&sql).map_err(src.query_failed())?;
    let rows = stmt
        .query_map([], |row| {
            let raw_type: Option<String> = row.get(3)?;
            Ok(RosterEntry {
                npi: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                name: row.get(1)?,
                specialty: row.get(2)?,
                provider_type: ProviderType::parse(raw_type.as_deref()),
            })
        })
        .map_err(src.query_failed())?
        .collect::<duckdb::Result<Vec<_>>>()
        .map_err(src.query_failed())?;
    Ok(rows)
}

pub fn load_payments(
    locator: &SourceLocator,
    period: &ReportingPeriod,
) -> Result<Vec<PaymentRecord>> {
    let src = open_source(locator, SourceKind::Payments)?;
    let npi = src.require(PAYMENT_NPI, ColumnKind::Text)?;
    let amount = src.require(PAYMENT_AMOUNT, ColumnKind::Numeric)?;
    let date = src.require(PAYMENT_DATE, ColumnKind::Date)?;
    let program_year = src.optional(PAYMENT_PROGRAM_YEAR);
    let record_id = src.optional(PAYMENT_RECORD_ID);
    let nature = src.optional(PAYMENT_NATURE);
    let drug = src.optional(PAYMENT_DRUG);
    let manufacturer = src.optional(PAYMENT_MANUFACTURER);
    let manufacturer_id = src.optional(PAYMENT_MANUFACTURER_ID);

    let date_ident = quote_ident(&date.name);
    let sql = format!(
        "
        WITH p AS (
            SELECT
                {npi} AS npi,
                {record_id} AS record_id,
                {manufacturer_id} AS manufacturer_id,
                {manufacturer} AS manufacturer,
                {amount} AS amount,
                {nature} AS nature,
                {drug} AS drug,
                COALESCE(
                    TRY_CAST({date_ident} AS DATE),
                    TRY_STRPTIME(CAST({date_ident} AS VARCHAR), '%m/%d/%Y')::DATE
                ) AS paid_on,
                {program_year} AS program_year
            FROM src
        )
        SELECT
            npi, record_id, manufacturer_id, manufacturer, amount, nature, drug,
            COALESCE(program_year, YEAR(paid_on)) AS year
        FROM p
        WHERE (paid_on BETWEEN DATE '{start}' AND DATE '{end}')
           OR (paid_on IS NULL AND program_year BETWEEN {y0} AND {y1})
        ",
        npi = npi_expr(&npi),
        record_id = text_expr(record_id.as_ref()),
        manufacturer_id = text_expr(manufacturer_id.as_ref()),
        manufacturer = text_expr(manufacturer.as_ref()),
        amount = double_expr(Some(&amount)),
        nature = text_expr(nature.as_ref()),
        drug = text_expr(drug.as_ref()),
        program_year = bigint_expr(program_year.as_ref()),
        start = period.start.format("%Y-%m-%d"),
        end = period.end.format("%Y-%m-%d"),
        y0 = period.first_year(),
        y1 = period.last_year(),
    );
    let mut stmt = src.conn.prepare(&sql).map_err(src.query_failed())?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PaymentRecord {
                recipient_npi: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                record_id: row.get(1)?,
                manufacturer_id: row.get(2)?,
                manufacturer: row.get(3)?,
                amount: row.get(4)?,
                nature: row.get(5)?,
                drug: row.get(6)?,
                program_year: row.get::<_, Option<i64>>(7)?.map(|y| y as i32),
            })
        })
        .map_err(src.query_failed())?
        .collect::<duckdb::Result<Vec<_>>>()
        .map_err(src.query_failed())?;
    ensure_rows_in_period(SourceKind::Payments, rows)
}

pub fn load_prescriptions(
    locator: &SourceLocator,
    period: &ReportingPeriod,
) -> Result<Vec<PrescriptionRecord>> {
    let src = open_source(locator, SourceKind::Prescriptions)?;
    let npi = src.require(RX_NPI, ColumnKind::Text)?;
    let brand = src.require(RX_BRAND, ColumnKind::Text)?;
    let generic = src.optional(RX_GENERIC);
    let claims = src.require(RX_CLAIMS, ColumnKind::Numeric)?;
    let cost = src.require(RX_COST, ColumnKind::Numeric)?;
    let days_supply = src.optional(RX_DAYS_SUPPLY);
    let year = src.require(RX_YEAR, ColumnKind::Numeric)?;
    let month = src.optional(RX_MONTH);

    let (ym0, ym1) = period.month_bounds();
    let sql = format!(
        "
        WITH r AS (
            SELECT
                {npi} AS npi,
                {brand} AS brand_name,
                {generic} AS generic_name,
                {claims} AS claim_count,
                {cost} AS total_cost,
                {days_supply} AS days_supply,
                {year} AS claim_year,
                {month} AS claim_month
            FROM src
        )
        SELECT npi, brand_name, generic_name, claim_count, total_cost, days_supply, claim_year, claim_month
        FROM r
        WHERE (claim_month IS NOT NULL AND claim_year * 100 + claim_month BETWEEN {ym0} AND {ym1})
           OR (claim_month IS NULL AND claim_year BETWEEN {y0} AND {y1})
        ",
        npi = npi_expr(&npi),
        brand = text_expr(Some(&brand)),
        generic = text_expr(generic.as_ref()),
        claims = double_expr(Some(&claims)),
        cost = double_expr(Some(&cost)),
        days_supply = double_expr(days_supply.as_ref()),
        year = bigint_expr(Some(&year)),
        month = bigint_expr(month.as_ref()),
        y0 = period.first_year(),
        y1 = period.last_year(),
    );
    let mut stmt = src.conn.prepare(&sql).map_err(src.query_failed())?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PrescriptionRecord {
                prescriber_npi: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                brand_name: row.get(1)?,
                generic_name: row.get(2)?,
                claim_count: row.get(3)?,
                total_cost: row.get(4)?,
                days_supply: row.get(5)?,
                claim_year: row.get::<_, Option<i64>>(6)?.map(|y| y as i32),
                claim_month: row.get::<_, Option<i64>>(7)?.map(|m| m as u32),
            })
        })
        .map_err(src.query_failed())?
        .collect::<duckdb::Result<Vec<_>>>()
        .map_err(src.query_failed())?;
    ensure_rows_in_period(SourceKind::Prescriptions, rows)
}

/// Runs a blocking loader on the tokio blocking pool and gives up after `timeout`.
pub async fn fetch_with_timeout<T, F>(
    source_kind: SourceKind,
    timeout: Duration,
    load: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(load);
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(query_failed(
            source_kind,
            format!("loader task failed: {join_err}"),
        )),
        Err(_) => Err(PipelineError::unavailable(
            source_kind,
            UnavailableReason::Timeout {
                secs: timeout.as_secs(),
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn period_2022() -> ReportingPeriod {
        ReportingPeriod::new(
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2022, 12, 31).unwrap(),
        )
        .unwrap()
    }

    fn write_file(dir: &Path, name: &str, contents: &str) -> SourceLocator {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        SourceLocator::File(path)
    }

    fn unavailable_reason(err: PipelineError) -> UnavailableReason {
        match err {
            PipelineError::DataUnavailable { reason, .. } => reason,
            other => panic!("expected DataUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn parses_locators() {
        assert_eq!(
            "data/roster.csv".parse::<SourceLocator>().unwrap(),
            SourceLocator::File(PathBuf::from("data/roster.csv"))
        );
        assert_eq!(
            "wh.duckdb::part_d".parse::<SourceLocator>().unwrap(),
            SourceLocator::Table {
                database: PathBuf::from("wh.duckdb"),
                table: "part_d".to_string()
            }
        );
        assert!("wh.duckdb::".parse::<SourceLocator>().is_err());
        assert!("  ".parse::<SourceLocator>().is_err());
    }

    #[test]
    fn loads_roster_with_case_insensitive_columns() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(
            dir.path(),
            "roster.csv",
            "npi,Provider_Name,specialty,credential\n\
             1234567893,Dr. A,Cardiology,MD\n\
             123456789,Short Npi,Oncology,NP\n",
        );
        let rows = load_roster(&loc).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].npi, "1234567893");
        assert_eq!(rows[0].name.as_deref(), Some("Dr. A"));
        assert_eq!(rows[0].provider_type, ProviderType::Physician);
        assert_eq!(rows[1].npi, "123456789");
        assert_eq!(rows[1].provider_type, ProviderType::NursePractitioner);
    }

    #[test]
    fn missing_file_is_data_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let loc = SourceLocator::File(dir.path().join("nope.csv"));
        assert!(matches!(
            unavailable_reason(load_roster(&loc).unwrap_err()),
            UnavailableReason::Missing(_)
        ));
    }

    #[test]
    fn zero_byte_file_is_empty_not_query_error() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(dir.path(), "rx.csv", "");
        assert_eq!(
            unavailable_reason(load_prescriptions(&loc, &period_2022()).unwrap_err()),
            UnavailableReason::Empty
        );
    }

    #[test]
    fn header_only_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(
            dir.path(),
            "rx.csv",
            "NPI,BRAND_NAME,GENERIC_NAME,PRESCRIPTIONS,PAYMENTS,CLAIM_YEAR\n",
        );
        assert_eq!(
            unavailable_reason(load_prescriptions(&loc, &period_2022()).unwrap_err()),
            UnavailableReason::Empty
        );
    }

    #[test]
    fn missing_required_column_is_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(
            dir.path(),
            "rx.csv",
            "NPI,BRAND_NAME,PAYMENTS,CLAIM_YEAR\n1234567893,HUMIRA,100.5,2022\n",
        );
        match load_prescriptions(&loc, &period_2022()).unwrap_err() {
            PipelineError::SchemaMismatch {
                source_kind,
                column,
                ..
            } => {
                assert_eq!(source_kind, SourceKind::Prescriptions);
                assert_eq!(column, "PRESCRIPTIONS");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_numeric_amount_column_is_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(
            dir.path(),
            "pay.csv",
            "covered_recipient_npi,total_amount_of_payment_usdollars,date_of_payment\n\
             1234567893,lots,2022-03-01\n",
        );
        assert!(matches!(
            load_payments(&loc, &period_2022()).unwrap_err(),
            PipelineError::SchemaMismatch { .. }
        ));
    }

    #[test]
    fn payments_filter_by_period_and_parse_us_dates() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(
            dir.path(),
            "pay.csv",
            "record_id,covered_recipient_npi,total_amount_of_payment_usdollars,date_of_payment,program_year,nature_of_payment_or_transfer_of_value,name_of_drug_or_biological_or_device_or_medical_supply_1,applicable_manufacturer_or_applicable_gpo_making_payment_name\n\
             r1,1234567893,150.25,03/15/2022,2022,Food and Beverage,Humira,AbbVie\n\
             r2,1234567893,99.00,07/01/2021,2021,Consulting Fee,Humira,AbbVie\n\
             r3,1234567893,20.00,12/31/2022,2022,Food and Beverage,Eliquis,BMS\n",
        );
        let rows = load_payments(&loc, &period_2022()).unwrap();
        let ids: Vec<_> = rows.iter().filter_map(|r| r.record_id.clone()).collect();
        assert_eq!(ids, vec!["r1".to_string(), "r3".to_string()]);
        assert_eq!(rows[0].amount, Some(150.25));
        assert_eq!(rows[0].program_year, Some(2022));
        assert_eq!(rows[0].drug.as_deref(), Some("Humira"));
        assert_eq!(rows[0].manufacturer.as_deref(), Some("AbbVie"));
    }

    #[test]
    fn rows_outside_period_are_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(
            dir.path(),
            "rx.csv",
            "NPI,BRAND_NAME,PRESCRIPTIONS,PAYMENTS,CLAIM_YEAR\n1234567893,HUMIRA,4,1200.0,2019\n",
        );
        assert_eq!(
            unavailable_reason(load_prescriptions(&loc, &period_2022()).unwrap_err()),
            UnavailableReason::NoRowsInPeriod
        );
    }

    #[test]
    fn prescriptions_filter_by_claim_month() {
        let dir = tempfile::tempdir().unwrap();
        let loc = write_file(
            dir.path(),
            "rx.csv",
            "NPI,BRAND_NAME,GENERIC_NAME,PRESCRIPTIONS,PAYMENTS,DAYS_SUPPLY,CLAIM_YEAR,CLAIM_MONTH\n\
             1234567893,Humira,adalimumab,2,5000.50,60,2022,6\n\
             1234567893,Humira,adalimumab,1,2500.00,30,2022,9\n",
        );
        let period = ReportingPeriod::new(
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2022, 6, 30).unwrap(),
        )
        .unwrap();
        let rows = load_prescriptions(&loc, &period).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].brand_name.as_deref(), Some("Humira"));
        assert_eq!(rows[0].generic_name.as_deref(), Some("adalimumab"));
        assert_eq!(rows[0].total_cost, Some(5000.5));
        assert_eq!(rows[0].days_supply, Some(60.0));
        assert_eq!(rows[0].claim_month, Some(6));
    }

    #[test]
    fn reads_table_from_duckdb_warehouse() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("warehouse.duckdb");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE roster (NPI BIGINT, name VARCHAR, specialty VARCHAR);
                 INSERT INTO roster VALUES (1234567893, 'Dr. A', 'Rheumatology');",
            )
            .unwrap();
        }
        let loc = SourceLocator::Table {
            database: db_path.clone(),
            table: "roster".to_string(),
        };
        let rows = load_roster(&loc).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].npi, "1234567893");
        assert_eq!(rows[0].specialty.as_deref(), Some("Rheumatology"));

        let missing = SourceLocator::Table {
            database: db_path,
            table: "part_d".to_string(),
        };
        assert!(matches!(
            unavailable_reason(load_roster(&missing).unwrap_err()),
            UnavailableReason::Missing(_)
        ));
    }

    #[tokio::test]
    async fn slow_loader_times_out() {
        let err = fetch_with_timeout(SourceKind::Payments, Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(
            unavailable_reason(err),
            UnavailableReason::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn fast_loader_passes_result_through() {
        let rows = fetch_with_timeout(SourceKind::Roster, Duration::from_secs(5), || {
            Ok(vec![1, 2, 3])
        })
        .await
        .unwrap();
        assert_eq!(rows, vec![1, 2, 3]);
    }
}
