//! SVG charts.
//!
//! Every public function draws one file and maps drawing failures to
//! [`ReportError::PlotError`]. Layout is functional, not polished.

use super::ReportError;
use crate::diagnostics::ParameterSummary;
use crate::fit::ModelFit;
use crate::psis::{K_PROBLEMATIC, K_QUESTIONABLE, K_UNRELIABLE, LooResult};
use crate::standardize::{Feature, StandardizedDataset};
use crate::sweep::SweepPoint;
use plotters::prelude::*;
use std::error::Error;
use std::path::Path;

pub const SCATTER_FILE: &str = "descriptive_scatter.svg";
pub const FOREST_FILE: &str = "forest.svg";
pub const PARETO_K_FILE: &str = "pareto_k.svg";
pub const TRACE_FILE: &str = "trace.svg";
pub const SENSITIVITY_FILE: &str = "sensitivity.svg";

type DrawResult = Result<(), Box<dyn Error>>;

fn svg_root(out_path: &Path, size: (u32, u32)) -> SVGBackend<'_> {
    log::info!("Writing {}", out_path.display());
    SVGBackend::new(out_path, size)
}

fn finish(path: &Path, result: DrawResult) -> Result<(), ReportError> {
    result.map_err(|e| ReportError::PlotError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Padded range over finite values, or `fallback` when there are none.
fn padded_range<I: IntoIterator<Item = f64>>(values: I, fallback: (f64, f64)) -> (f64, f64) {
    let (lo, hi) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return fallback;
    }
    let pad = ((hi - lo) * 0.05).max(1e-3);
    (lo - pad, hi + pad)
}

/// Standardized speed against standardized accuracy, colored by stress label.
pub fn descriptive_scatter(path: &Path, data: &StandardizedDataset) -> Result<(), ReportError> {
    finish(path, draw_scatter(path, data))
}

fn draw_scatter(path: &Path, data: &StandardizedDataset) -> DrawResult {
    let speed = data.feature(Feature::Speed);
    let accuracy = data.feature(Feature::Accuracy);
    let points: Vec<(f64, f64, bool)> = data
        .dataset()
        .recordings
        .iter()
        .enumerate()
        .filter_map(|(i, r)| Some((speed.get(i)?, accuracy.get(i)?, r.stress)))
        .collect();
    let x_range = padded_range(points.iter().map(|p| p.0), (-3.0, 3.0));
    let y_range = padded_range(points.iter().map(|p| p.1), (-3.0, 3.0));

    let root = svg_root(path, (900, 700)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Speed vs accuracy by stress label", ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range.0..x_range.1, y_range.0..y_range.1)?;
    chart
        .configure_mesh()
        .x_desc("speed (standardized)")
        .y_desc("accuracy (standardized)")
        .draw()?;

    for (stressed, color, label) in [(false, BLUE, "calm"), (true, RED, "stressed")] {
        chart
            .draw_series(
                points
                    .iter()
                    .filter(|p| p.2 == stressed)
                    .map(|&(x, y, _)| Circle::new((x, y), 3, color.mix(0.6).filled())),
            )?
            .label(label)
            .legend(move |(x, y)| Circle::new((x + 8, y), 4, color.filled()));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// Posterior means with HDI bars, one row per parameter.
pub fn forest_plot(
    path: &Path,
    summaries: &[ParameterSummary],
    hdi_prob: f64,
) -> Result<(), ReportError> {
    finish(path, draw_forest(path, summaries, hdi_prob))
}

fn draw_forest(path: &Path, summaries: &[ParameterSummary], hdi_prob: f64) -> DrawResult {
    let n = summaries.len().max(1);
    let x_range = padded_range(
        summaries
            .iter()
            .flat_map(|s| [s.hdi_lower, s.hdi_upper, 0.0]),
        (-1.0, 1.0),
    );
    let names: Vec<String> = summaries.iter().map(|s| s.name.clone()).collect();

    let root = svg_root(path, (900, 120 + 40 * n as u32)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Posterior means with {:.0}% HDI", hdi_prob * 100.0),
            ("sans-serif", 20),
        )
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(140)
        .build_cartesian_2d(x_range.0..x_range.1, -0.5..(n as f64 - 0.5))?;

    let label_for = |y: &f64| -> String {
        let index = y.round();
        if (y - index).abs() > 1e-6 || index < 0.0 {
            return String::new();
        }
        // Top row is the first parameter.
        names
            .get(n - 1 - index as usize)
            .cloned()
            .unwrap_or_default()
    };
    chart
        .configure_mesh()
        .y_labels(n)
        .y_label_formatter(&label_for)
        .disable_y_mesh()
        .x_desc("value")
        .draw()?;

    chart.draw_series(std::iter::once(PathElement::new(
        vec![(0.0, -0.5), (0.0, n as f64 - 0.5)],
        BLACK.mix(0.4),
    )))?;
    for (i, s) in summaries.iter().enumerate() {
        let y = (n - 1 - i) as f64;
        chart.draw_series(std::iter::once(PathElement::new(
            vec![(s.hdi_lower, y), (s.hdi_upper, y)],
            BLUE.stroke_width(2),
        )))?;
        chart.draw_series(std::iter::once(Circle::new((s.mean, y), 4, BLUE.filled())))?;
    }
    root.present()?;
    Ok(())
}

/// Pareto k per observation with the fixed reliability thresholds.
pub fn pareto_k_plot(path: &Path, loo: &LooResult) -> Result<(), ReportError> {
    finish(path, draw_pareto_k(path, loo))
}

fn draw_pareto_k(path: &Path, loo: &LooResult) -> DrawResult {
    let ks = loo.pareto_k();
    let finite_max = ks.iter().copied().filter(|k| k.is_finite()).fold(K_UNRELIABLE, f64::max);
    let y_max = finite_max + 0.1;
    let y_min = ks.iter().copied().filter(|k| k.is_finite()).fold(0.0, f64::min) - 0.1;
    let n = ks.len().max(1) as f64;

    let root = svg_root(path, (1000, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("PSIS diagnostic: Pareto k", ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-1.0..n, y_min..y_max)?;
    chart
        .configure_mesh()
        .x_desc("observation")
        .y_desc("k")
        .draw()?;

    for (threshold, color) in [
        (K_QUESTIONABLE, YELLOW.mix(0.9)),
        (K_PROBLEMATIC, MAGENTA.mix(0.7)),
        (K_UNRELIABLE, RED.mix(0.7)),
    ] {
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(-1.0, threshold), (n, threshold)],
                color,
            )))?
            .label(format!("k = {threshold}"))
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart.draw_series(ks.iter().enumerate().map(|(i, &k)| {
        let (value, style) = if k.is_finite() {
            (k, BLUE.mix(0.7).filled())
        } else {
            (y_max - 0.05, RED.filled())
        };
        Circle::new((i as f64, value), 3, style)
    }))?;
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// Per-chain traces of the intercept and slopes, one panel each.
pub fn trace_plot(path: &Path, fit: &ModelFit) -> Result<(), ReportError> {
    finish(path, draw_trace(path, fit))
}

fn draw_trace(path: &Path, fit: &ModelFit) -> DrawResult {
    let chains = fit.constrained_chains();
    let names = fit.parameter_names();
    let k = fit.n_population();
    let draws = chains.first().map(|c| c.nrows()).unwrap_or(0).max(1);

    let root = svg_root(path, (1000, 220 * k as u32)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((k, 1));
    for (j, panel) in panels.iter().enumerate() {
        let y_range = padded_range(
            chains.iter().flat_map(|c| c.column(j).to_vec()),
            (-1.0, 1.0),
        );
        let mut chart = ChartBuilder::on(panel)
            .caption(&names[j], ("sans-serif", 16))
            .margin(8)
            .x_label_area_size(30)
            .y_label_area_size(60)
            .build_cartesian_2d(0..draws, y_range.0..y_range.1)?;
        chart.configure_mesh().disable_x_mesh().draw()?;
        for (c, chain) in chains.iter().enumerate() {
            let color = Palette99::pick(c).mix(0.8);
            chart.draw_series(LineSeries::new(
                chain.column(j).iter().copied().enumerate(),
                color,
            ))?;
        }
    }
    root.present()?;
    Ok(())
}

/// Posterior mean and HDI of each named parameter across sweep thresholds.
pub fn sensitivity_plot(
    path: &Path,
    points: &[SweepPoint],
    parameters: &[String],
) -> Result<(), ReportError> {
    finish(path, draw_sensitivity(path, points, parameters))
}

fn draw_sensitivity(path: &Path, points: &[SweepPoint], parameters: &[String]) -> DrawResult {
    let k = parameters.len().max(1);
    let x_range = padded_range(points.iter().map(|p| f64::from(p.threshold)), (0.0, 100.0));

    let root = svg_root(path, (1000, 240 * k as u32)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((k, 1));
    for (panel, name) in panels.iter().zip(parameters) {
        let series: Vec<(f64, &ParameterSummary)> = points
            .iter()
            .filter_map(|p| Some((f64::from(p.threshold), p.coefficient(name)?)))
            .collect();
        let y_range = padded_range(
            series
                .iter()
                .flat_map(|(_, c)| [c.hdi_lower, c.hdi_upper]),
            (-1.0, 1.0),
        );
        let mut chart = ChartBuilder::on(panel)
            .caption(name, ("sans-serif", 16))
            .margin(8)
            .x_label_area_size(30)
            .y_label_area_size(60)
            .build_cartesian_2d(x_range.0..x_range.1, y_range.0..y_range.1)?;
        chart
            .configure_mesh()
            .x_desc("minimum trajectories")
            .draw()?;
        if y_range.0 < 0.0 && y_range.1 > 0.0 {
            chart.draw_series(std::iter::once(PathElement::new(
                vec![(x_range.0, 0.0), (x_range.1, 0.0)],
                BLACK.mix(0.4),
            )))?;
        }
        for &(x, c) in &series {
            chart.draw_series(std::iter::once(PathElement::new(
                vec![(x, c.hdi_lower), (x, c.hdi_upper)],
                BLUE.stroke_width(2),
            )))?;
        }
        chart.draw_series(LineSeries::new(
            series.iter().map(|&(x, c)| (x, c.mean)),
            BLUE,
        ))?;
        chart.draw_series(
            series
                .iter()
                .map(|&(x, c)| Circle::new((x, c.mean), 4, BLUE.filled())),
        )?;
    }
    root.present()?;
    Ok(())
}
