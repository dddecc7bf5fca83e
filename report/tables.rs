//! Terminal tables.

use super::{DescriptiveSummary, LooSummary};
use crate::compare::Comparison;
use crate::diagnostics::{ConvergenceReport, ParameterSummary};
use crate::filter::FilterSummary;
use crate::psis::{LooResult, ParetoKCategory};
use crate::sweep::SweepPoint;
use comfy_table::{Cell, Color, ContentArrangement, Row, Table, presets::UTF8_FULL};

fn new_table<I, S>(header: I) -> Table
where
    I: IntoIterator<Item = S>,
    S: Into<Cell>,
{
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.into_iter().map(Into::into).collect::<Vec<Cell>>());
    table
}

fn moments_cell(m: Option<crate::standardize::Moments>) -> Cell {
    match m {
        Some(m) => Cell::new(format!("{:.3} ± {:.3} (n={})", m.mean, m.sd, m.count)),
        None => Cell::new("-"),
    }
}

pub fn descriptive_table(summary: &DescriptiveSummary) -> Table {
    let mut table = new_table(["Column", "Missing", "Calm (mean ± sd)", "Stressed (mean ± sd)"]);
    for c in &summary.columns {
        table.add_row(Row::from(vec![
            Cell::new(&c.name),
            Cell::new(c.missing),
            moments_cell(c.calm),
            moments_cell(c.stressed),
        ]));
    }
    table
}

pub fn filter_table(summary: &FilterSummary) -> Table {
    let mut table = new_table(["Threshold", "Rows in", "Kept", "No speed", "Below threshold", "Users"]);
    table.add_row(Row::from(vec![
        Cell::new(summary.threshold),
        Cell::new(summary.rows_in),
        Cell::new(summary.rows_kept),
        Cell::new(summary.dropped_missing_speed),
        Cell::new(summary.dropped_below_threshold),
        Cell::new(summary.users_kept),
    ]));
    table
}

/// Parameter table; R-hat and ESS ratio outside `report`'s thresholds are
/// highlighted.
pub fn parameter_table(
    summaries: &[ParameterSummary],
    hdi_prob: f64,
    report: &ConvergenceReport,
) -> Table {
    let pct = (hdi_prob * 100.0).round();
    let mut table = new_table([
        "Parameter".to_string(),
        "Mean".to_string(),
        "SD".to_string(),
        format!("HDI {pct}% low"),
        format!("HDI {pct}% high"),
        "R-hat".to_string(),
        "ESS ratio".to_string(),
    ]);
    for s in summaries {
        let mut rhat = Cell::new(format!("{:.3}", s.rhat));
        if !(s.rhat <= report.thresholds.max_rhat) {
            rhat = rhat.fg(Color::Red);
        }
        let mut ess = Cell::new(format!("{:.3}", s.ess_ratio));
        if !(s.ess_ratio >= report.thresholds.min_ess_ratio) {
            ess = ess.fg(Color::Red);
        }
        table.add_row(Row::from(vec![
            Cell::new(&s.name),
            Cell::new(format!("{:.4}", s.mean)),
            Cell::new(format!("{:.4}", s.sd)),
            Cell::new(format!("{:.4}", s.hdi_lower)),
            Cell::new(format!("{:.4}", s.hdi_upper)),
            rhat,
            ess,
        ]));
    }
    table
}

pub fn loo_table(loo: &LooResult) -> Table {
    let summary = LooSummary::from(loo);
    let mut table = new_table(["Quantity", "Estimate", "SE"]);
    for (name, estimate, se) in [
        ("elpd_loo", summary.elpd_loo, summary.se_elpd_loo),
        ("p_loo", summary.p_loo, summary.se_p_loo),
        ("looic", summary.looic, summary.se_looic),
    ] {
        table.add_row(Row::from(vec![
            Cell::new(name),
            Cell::new(format!("{estimate:.2}")),
            Cell::new(format!("{se:.2}")),
        ]));
    }
    let counts = loo.category_counts();
    for category in ParetoKCategory::ALL {
        let count = counts[category as usize];
        let mut cell = Cell::new(count);
        if category != ParetoKCategory::Good && count > 0 {
            cell = cell.fg(Color::Yellow);
        }
        table.add_row(Row::from(vec![
            Cell::new(format!("Pareto k {category}")),
            cell,
            Cell::new(""),
        ]));
    }
    table
}

pub fn comparison_table(comparison: &Comparison) -> Table {
    let mut table = new_table([
        "Model",
        "looic",
        "SE",
        "elpd_diff",
        "SE diff",
        "p_loo",
        "Within 1 SE",
        "k > 0.7",
    ]);
    for e in &comparison.entries {
        let mut name = Cell::new(&e.name);
        if e.name == comparison.best {
            name = name.fg(Color::Green);
        }
        table.add_row(Row::from(vec![
            name,
            Cell::new(format!("{:.2}", e.looic)),
            Cell::new(format!("{:.2}", e.se_looic)),
            Cell::new(format!("{:.2}", e.elpd_diff)),
            Cell::new(format!("{:.2}", e.se_diff)),
            Cell::new(format!("{:.2}", e.p_loo)),
            Cell::new(if e.within_one_se { "yes" } else { "no" }),
            Cell::new(e.high_k),
        ]));
    }
    table
}

pub fn pairwise_table(comparison: &Comparison) -> Table {
    let mut table = new_table(["First", "Second", "elpd(first) - elpd(second)", "SE"]);
    for p in &comparison.pairwise {
        table.add_row(Row::from(vec![
            Cell::new(&p.first),
            Cell::new(&p.second),
            Cell::new(format!("{:.2}", p.elpd_diff)),
            Cell::new(format!("{:.2}", p.se_diff)),
        ]));
    }
    table
}

/// One row per threshold with the posterior mean and HDI of `parameters`.
pub fn sweep_table(points: &[SweepPoint], parameters: &[String]) -> Table {
    let mut header = vec!["Threshold".to_string(), "Rows".to_string(), "Users".to_string()];
    header.extend(parameters.iter().cloned());
    header.push("Converged".to_string());
    let mut table = new_table(header);
    for point in points {
        let mut cells = vec![
            Cell::new(point.threshold),
            Cell::new(point.filter.rows_kept),
            Cell::new(point.filter.users_kept),
        ];
        match &point.outcome {
            Ok(fit) => {
                for name in parameters {
                    cells.push(match point.coefficient(name) {
                        Some(c) => Cell::new(format!(
                            "{:.3} [{:.3}, {:.3}]",
                            c.mean, c.hdi_lower, c.hdi_upper
                        )),
                        None => Cell::new("-"),
                    });
                }
                cells.push(if fit.convergence.converged {
                    Cell::new("yes")
                } else {
                    Cell::new("no").fg(Color::Red)
                });
            }
            Err(e) => {
                cells.extend(parameters.iter().map(|_| Cell::new("-")));
                cells.push(Cell::new(format!("failed: {e}")).fg(Color::Red));
            }
        }
        table.add_row(Row::from(cells));
    }
    table
}
