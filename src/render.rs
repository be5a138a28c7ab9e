use csv::Writer;
use std::path::Path;

use crate::aggregate::CohortRecord;
use crate::common::{ensure_parent_dir, finish_atomic, tmp_path_for, to_io_error, write_atomic};
use crate::error::{PipelineError, Result};
use crate::join::DiscardEntry;
use crate::report::{Report, Section, SourceStatus};

pub fn render_json(report: &Report) -> serde_json::Result<String> {
    let mut json = serde_json::to_string_pretty(report)?;
    json.push('\n');
    Ok(json)
}

pub fn write_json(path: &Path, report: &Report) -> Result<()> {
    let json =
        render_json(report).map_err(|err| PipelineError::write_failure(path, to_io_error(err)))?;
    write_atomic(path, &json)
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn fmt_money(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (idx, ch) in whole.chars().enumerate() {
        if idx > 0 && (whole.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}${grouped}.{:02}", cents % 100)
}

fn fmt_opt_money(value: Option<f64>) -> String {
    value.map(fmt_money).unwrap_or_else(|| "n/a".to_string())
}

fn fmt_ratio(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.1}x"))
        .unwrap_or_else(|| "n/a".to_string())
}

fn fmt_pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.2}%"))
        .unwrap_or_else(|| "n/a".to_string())
}

fn fmt_count(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}

fn cohort_label(record: &CohortRecord) -> String {
    let key = &record.key;
    if let Some(t) = key.provider_type {
        t.label().to_string()
    } else if let Some(s) = &key.specialty {
        s.clone()
    } else if let Some(tier) = key.payment_tier {
        tier.label().to_string()
    } else if let Some(n) = key.consecutive_years {
        format!("{n} yr")
    } else {
        "all prescribers".to_string()
    }
}

/// Renders a section body, or the unavailable marker.
fn render_section<T>(
    out: &mut String,
    title: &str,
    section: &Section<T>,
    body: impl FnOnce(&mut String, &T),
) {
    out.push_str(&format!("## {title}\n\n"));
    match section {
        Section::Computed { data, notes } => {
            body(out, data);
            if !notes.is_empty() {
                out.push('\n');
                for note in notes {
                    out.push_str(&format!("- low sample: {}\n", escape_cell(note)));
                }
            }
        }
        Section::Unavailable { detail, .. } => {
            out.push_str(&format!("_[data not available: {detail}]_\n"));
        }
    }
    out.push('\n');
}

fn render_cohort_table(out: &mut String, records: &[CohortRecord]) {
    if records.is_empty() {
        out.push_str("_No cohorts._\n");
        return;
    }
    out.push_str(
        "| drug | cohort | providers | paid | unpaid | avg rx paid | avg rx unpaid | avg payment | payment share | influence | ROI | low sample |\n",
    );
    out.push_str("| --- | --- | ---: | ---: | ---: | ---: | ---: | ---: | ---: | ---: | ---: | :---: |\n");
    for record in records {
        let m = &record.metrics;
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |\n",
            escape_cell(record.key.drug.as_str()),
            escape_cell(&cohort_label(record)),
            m.provider_count,
            m.paid_count,
            m.unpaid_count,
            fmt_opt_money(m.avg_rx_paid),
            fmt_opt_money(m.avg_rx_unpaid),
            fmt_opt_money(m.avg_payment),
            fmt_pct(m.payment_share_pct),
            fmt_ratio(m.influence_factor),
            fmt_ratio(m.roi_factor),
            if m.sample_size_flag { "yes" } else { "" },
        ));
    }
}

pub fn render_markdown(report: &Report) -> String {
    let mut out = String::new();
    out.push_str("# Payment Influence Report\n\n");
    out.push_str(&format!(
        "Period `{}` to `{}`, attribution `{}`, minimum sample size {}.\n\n",
        report.period.start, report.period.end, report.attribution, report.min_sample_size
    ));
    if !report.unmatched_drugs.is_empty() {
        let names = report
            .unmatched_drugs
            .iter()
            .map(|d| format!("`{d}`"))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!(
            "Requested drugs with no joined prescriptions (not measured): {names}.\n\n"
        ));
    }

    let rec = &report.reconciliation;
    out.push_str("## Reconciliation\n\n");
    out.push_str("| source | status | rows read | joined | discarded | checksum warnings |\n");
    out.push_str("| --- | --- | ---: | ---: | ---: | ---: |\n");
    for (source, status) in &rec.sources {
        let tally = rec.tally.source(*source);
        let status = match status {
            SourceStatus::Loaded { .. } => "loaded".to_string(),
            SourceStatus::Unavailable { detail, .. } => format!("unavailable: {}", escape_cell(detail)),
        };
        out.push_str(&format!(
            "| {source} | {status} | {} | {} | {} | {} |\n",
            tally.rows_read,
            tally.joined,
            tally.discarded(),
            tally.checksum_warnings,
        ));
    }
    out.push_str(&format!(
        "\n{} providers joined, {} rows discarded.\n\n",
        rec.providers_joined, rec.discard_count
    ));

    let sections = &report.sections;
    render_section(&mut out, "Roster Mix", &sections.roster_mix, |out, rows| {
        out.push_str("| provider type | providers | share |\n");
        out.push_str("| --- | ---: | ---: |\n");
        for row in rows {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                row.provider_type,
                row.providers,
                fmt_pct(row.share_pct)
            ));
        }
    });

    render_section(
        &mut out,
        "Payment Categories",
        &sections.payment_categories,
        |out, rows| {
            out.push_str("| category | payments | providers | total | average | share |\n");
            out.push_str("| --- | ---: | ---: | ---: | ---: | ---: |\n");
            for row in rows {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} |\n",
                    escape_cell(&row.category),
                    row.payment_count,
                    row.providers,
                    fmt_money(row.total_payments),
                    fmt_money(row.avg_payment),
                    fmt_pct(row.share_pct)
                ));
            }
        },
    );

    render_section(
        &mut out,
        "Prescription Patterns",
        &sections.prescription_patterns,
        |out, rows| {
            out.push_str("| drug | generic | prescribers | claims | total cost | days supply | cost per prescriber |\n");
            out.push_str("| --- | --- | ---: | ---: | ---: | ---: | ---: |\n");
            for row in rows {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} | {} |\n",
                    escape_cell(row.drug.as_str()),
                    row.generic_name
                        .as_ref()
                        .map(|g| escape_cell(g.as_str()))
                        .unwrap_or_default(),
                    row.prescribers,
                    fmt_count(row.claims),
                    fmt_money(row.total_cost),
                    fmt_count(row.days_supply),
                    fmt_opt_money(row.avg_cost_per_prescriber)
                ));
            }
        },
    );

    for (title, section) in sections.cohort_sections() {
        render_section(&mut out, title, section, |out, records| {
            render_cohort_table(out, records)
        });
    }

    render_section(
        &mut out,
        "Provider Risk Scores",
        &sections.provider_risk,
        |out, rows| {
            out.push_str("| NPI | name | specialty | drug | tier | years | rx cost | rx ratio | score |\n");
            out.push_str("| --- | --- | --- | --- | --- | ---: | ---: | ---: | ---: |\n");
            for row in rows {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} | {} | {} | {:.1} |\n",
                    row.npi,
                    escape_cell(row.name.as_deref().unwrap_or("")),
                    escape_cell(&row.specialty),
                    escape_cell(row.drug.as_str()),
                    row.payment_tier,
                    row.consecutive_years,
                    fmt_money(row.rx_cost),
                    fmt_ratio(row.rx_ratio),
                    row.risk_score
                ));
            }
        },
    );

    out
}

pub fn write_markdown(path: &Path, report: &Report) -> Result<()> {
    write_atomic(path, &render_markdown(report))
}

fn write_csv_atomic(
    path: &Path,
    fill: impl FnOnce(&mut Writer<std::fs::File>) -> csv::Result<()>,
) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path);
    let fail = |err: csv::Error| PipelineError::write_failure(path, to_io_error(err));
    let mut writer = Writer::from_path(&tmp_path).map_err(fail)?;
    let filled = fill(&mut writer).map_err(fail).and_then(|()| {
        writer
            .flush()
            .map_err(|err| PipelineError::write_failure(path, err))
    });
    drop(writer);
    if let Err(err) = filled {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }
    finish_atomic(&tmp_path, path)
}

fn opt_cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Every cohort record of every cohort section, one row each.
pub fn write_cohorts_csv(path: &Path, report: &Report) -> Result<()> {
    let sections = report.sections.cohort_sections();
    write_csv_atomic(path, |writer| {
        writer.write_record([
            "section",
            "drug",
            "provider_type",
            "specialty",
            "payment_tier",
            "consecutive_years",
            "provider_count",
            "paid_count",
            "unpaid_count",
            "avg_rx_paid",
            "avg_rx_unpaid",
            "total_rx_paid",
            "total_rx_unpaid",
            "total_payments",
            "avg_payment",
            "payment_share_pct",
            "influence_factor",
            "roi_factor",
            "sample_size_flag",
        ])?;
        for (title, section) in sections {
            let Some(records) = section.data() else {
                continue;
            };
            for record in records {
                let key = &record.key;
                let m = &record.metrics;
                writer.write_record([
                    title.to_string(),
                    key.drug.to_string(),
                    opt_cell(key.provider_type),
                    opt_cell(key.specialty.as_deref()),
                    opt_cell(key.payment_tier),
                    opt_cell(key.consecutive_years),
                    m.provider_count.to_string(),
                    m.paid_count.to_string(),
                    m.unpaid_count.to_string(),
                    opt_cell(m.avg_rx_paid),
                    opt_cell(m.avg_rx_unpaid),
                    m.total_rx_paid.to_string(),
                    m.total_rx_unpaid.to_string(),
                    m.total_payments.to_string(),
                    opt_cell(m.avg_payment),
                    opt_cell(m.payment_share_pct),
                    opt_cell(m.influence_factor),
                    opt_cell(m.roi_factor),
                    m.sample_size_flag.to_string(),
                ])?;
            }
        }
        Ok(())
    })
}

pub fn write_discards_csv(path: &Path, ledger: &[DiscardEntry]) -> Result<()> {
    write_csv_atomic(path, |writer| {
        writer.write_record(["source", "identifier", "record_id", "reason", "detail"])?;
        for entry in ledger {
            writer.write_record([
                entry.source_kind.as_str(),
                entry.identifier.as_str(),
                entry.record_id.as_deref().unwrap_or(""),
                entry.reason.to_string().as_str(),
                entry.detail.as_str(),
            ])?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::{period, scenario_one};
    use crate::cohort::PaymentAttribution;
    use crate::error::UnavailableReason;
    use crate::join::JoinOptions;
    use crate::model::SourceKind;
    use crate::report::{AnalysisOptions, Inputs, build_report, join_inputs};
    use std::fs;

    fn options() -> AnalysisOptions {
        AnalysisOptions {
            drugs: Vec::new(),
            top_drugs: None,
            attribution: PaymentAttribution::Drug,
            min_sample_size: 30,
            top_risk: 25,
            strict_npi_checksum: false,
        }
    }

    fn scenario_report(reverse: bool) -> Report {
        let (mut roster, mut payments, mut prescriptions) = scenario_one();
        if reverse {
            roster.reverse();
            payments.reverse();
            prescriptions.reverse();
        }
        let inputs = Inputs {
            roster: Ok(roster),
            payments: Ok(payments),
            prescriptions: Ok(prescriptions),
        };
        let snapshot = join_inputs(period(), &options(), &inputs);
        build_report(&snapshot, &options(), &inputs).unwrap()
    }

    fn degraded_report() -> Report {
        let (roster, payments, _) = scenario_one();
        let inputs = Inputs {
            roster: Ok(roster),
            payments: Ok(payments),
            prescriptions: Err(PipelineError::unavailable(
                SourceKind::Prescriptions,
                UnavailableReason::Empty,
            )),
        };
        let snapshot = join_inputs(period(), &options(), &inputs);
        build_report(&snapshot, &options(), &inputs).unwrap()
    }

    #[test]
    fn json_round_trip_preserves_metrics() {
        for report in [scenario_report(false), degraded_report()] {
            let json = render_json(&report).unwrap();
            let back: Report = serde_json::from_str(&json).unwrap();
            assert_eq!(back, report);
        }
    }

    #[test]
    fn identical_inputs_render_identical_bytes() {
        let a = render_json(&scenario_report(false)).unwrap();
        let b = render_json(&scenario_report(true)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn json_sections_carry_explicit_status() {
        let value: serde_json::Value =
            serde_json::from_str(&render_json(&degraded_report()).unwrap()).unwrap();
        let patterns = &value["sections"]["prescription_patterns"];
        assert_eq!(patterns["status"], "unavailable");
        assert_eq!(patterns["kind"], "data_unavailable");
        assert_eq!(patterns["source"], "prescriptions");
        assert!(patterns.get("data").is_none());
        assert_eq!(value["sections"]["roster_mix"]["status"], "computed");

        let full: serde_json::Value =
            serde_json::from_str(&render_json(&scenario_report(false)).unwrap()).unwrap();
        let record = &full["sections"]["influence_by_drug"]["data"][0];
        assert_eq!(record["drug"], "HUMIRA");
        assert_eq!(record["influence_factor"], 3.23);
        assert_eq!(record["sample_size_flag"], true);
        assert!(record.get("payment_tier").is_none());
    }

    #[test]
    fn markdown_uses_one_decimal_ratios_and_marks_missing_sections() {
        let md = render_markdown(&scenario_report(false));
        assert!(md.contains("## Influence by Drug"));
        assert!(md.contains("| 3.2x |"));
        assert!(md.contains("$26,728.00"));

        let degraded = render_markdown(&degraded_report());
        assert!(degraded.contains(
            "## Prescription Patterns\n\n_[data not available: prescriptions data unavailable: source returned zero rows]_"
        ));
        assert!(degraded.contains("## Roster Mix\n\n| provider type"));
        assert!(!md.contains("Requested drugs"));
    }

    #[test]
    fn markdown_lists_unmatched_drugs() {
        let mut report = scenario_report(false);
        report.unmatched_drugs = vec![crate::model::DrugKey::normalize("ozempic").unwrap()];
        let md = render_markdown(&report);
        assert!(md.contains("Requested drugs with no joined prescriptions (not measured): `OZEMPIC`."));

        let back: Report = serde_json::from_str(&render_json(&report).unwrap()).unwrap();
        assert_eq!(back.unmatched_drugs, report.unmatched_drugs);
    }

    #[test]
    fn money_formatting_groups_thousands() {
        assert_eq!(fmt_money(0.5), "$0.50");
        assert_eq!(fmt_money(1234567.891), "$1,234,567.89");
        assert_eq!(fmt_money(-1000.0), "-$1,000.00");
        assert_eq!(fmt_ratio(None), "n/a");
    }

    #[test]
    fn writes_cohort_and_discard_csvs() {
        let dir = tempfile::tempdir().unwrap();
        let report = scenario_report(false);
        let cohorts = dir.path().join("out").join("report-cohorts.csv");
        write_cohorts_csv(&cohorts, &report).unwrap();
        let text = fs::read_to_string(&cohorts).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("section,drug,provider_type"));
        assert!(text.contains("Influence by Drug,HUMIRA,,,,,15,10,5,"));
        assert!(!tmp_path_for(&cohorts).exists());

        let roster = vec![crate::model::RosterEntry {
            npi: "123456789".to_string(),
            name: None,
            specialty: None,
            provider_type: crate::model::ProviderType::Unknown,
        }];
        let snapshot = crate::join::join(period(), &roster, &[], &[], &JoinOptions::default());
        let discards = dir.path().join("report-discards.csv");
        write_discards_csv(&discards, &snapshot.ledger).unwrap();
        let text = fs::read_to_string(&discards).unwrap();
        assert_eq!(
            text.lines().collect::<Vec<_>>()[..2],
            [
                "source,identifier,record_id,reason,detail",
                "roster,123456789,,malformed_npi:wrong_length,malformed NPI `123456789` in roster: wrong_length",
            ]
        );
    }

    #[test]
    fn unwritable_destination_is_a_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file").unwrap();
        let err = write_json(&blocker.join("report.json"), &scenario_report(false)).unwrap_err();
        assert!(matches!(err, PipelineError::WriteFailure { .. }));
        let err = write_discards_csv(&blocker.join("d.csv"), &[]).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
