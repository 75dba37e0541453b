//! Inspection output and training curves.

use std::ops::Range;
use std::path::{Path, PathBuf};

use plotters::prelude::*;

use crate::error::{Result, TransferError};
use crate::freeze::{count_frozen, LayerSpec};
use crate::training::TrainingHistory;

const TRAIN_COLOR: RGBColor = BLUE;
const VALID_COLOR: RGBColor = RED;

/// Log the pretrained layers with their trainability, then the parameter counts.
pub fn log_layers(layers: &[LayerSpec], total_params: usize, trainable_params: usize) {
    log::info!("{:<14} {:<8} state", "layer", "kind");
    for layer in layers {
        log::info!("{layer}");
    }
    let frozen_weighted = layers
        .iter()
        .filter(|layer| !layer.trainable && layer.kind.has_params())
        .count();
    log::info!(
        "{} of {} pretrained layers frozen, {frozen_weighted} of them with weights",
        count_frozen(layers),
        layers.len()
    );
    log::info!(
        "Total params: {total_params}, trainable: {trainable_params}, non-trainable: {}",
        total_params.saturating_sub(trainable_params)
    );
}

/// Log one line of metrics per epoch.
pub fn log_history(history: &TrainingHistory) {
    log::info!(
        "{:>5} {:>10} {:>10} {:>10} {:>12}",
        "epoch",
        "loss",
        "accuracy",
        "val_loss",
        "val_accuracy"
    );

    for epoch in 0..history.epochs() {
        log::info!(
            "{:>5} {:>10.4} {:>10.4} {:>10.4} {:>12.4}",
            epoch + 1,
            history.train_loss[epoch],
            history.train_accuracy[epoch],
            history.valid_loss[epoch],
            history.valid_accuracy[epoch]
        );
    }
}

/// Render `loss.png` and `accuracy.png` into `dir`, each with a training and a
/// validation curve.
pub fn plot_history(history: &TrainingHistory, dir: &Path) -> Result<Vec<PathBuf>> {
    if history.epochs() == 0 {
        return Err(TransferError::Plot("the history has no epochs".to_string()));
    }
    std::fs::create_dir_all(dir)?;

    let loss = dir.join("loss.png");
    plot_curves(
        &loss,
        "Training and validation loss",
        "loss",
        &history.train_loss,
        &history.valid_loss,
    )?;

    let accuracy = dir.join("accuracy.png");
    plot_curves(
        &accuracy,
        "Training and validation accuracy",
        "accuracy",
        &history.train_accuracy,
        &history.valid_accuracy,
    )?;

    log::info!(
        "Saved training curves to {} and {}",
        loss.display(),
        accuracy.display()
    );

    Ok(vec![loss, accuracy])
}

fn plot_curves(path: &Path, title: &str, metric: &str, train: &[f64], valid: &[f64]) -> Result<()> {
    let (x_range, y_range) = chart_ranges(&[train, valid]);
    let root = BitMapBackend::new(path, (720, 560)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| plot_error("backend", e))?;

    {
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(title, ("sans-serif", 24.0))
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Bottom, 60)
            .build_cartesian_2d(x_range, y_range)
            .map_err(|e| plot_error("chart build", e))?;

        chart
            .configure_mesh()
            .x_desc("epoch")
            .y_desc(metric)
            .draw()
            .map_err(|e| plot_error("mesh", e))?;

        for (label, values, color) in [
            ("train", train, TRAIN_COLOR),
            ("validation", valid, VALID_COLOR),
        ] {
            chart
                .draw_series(LineSeries::new(epoch_points(values), &color))
                .map_err(|e| plot_error("draw", e))?
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(|e| plot_error("legend", e))?;
    }

    root.present().map_err(|e| plot_error("render", e))
}

fn epoch_points(values: &[f64]) -> impl Iterator<Item = (f64, f64)> + '_ {
    values
        .iter()
        .enumerate()
        .map(|(epoch, value)| ((epoch + 1) as f64, *value))
}

fn plot_error(stage: &str, err: impl std::fmt::Display) -> TransferError {
    TransferError::Plot(format!("{stage} error: {err}"))
}

/// Axis ranges covering every finite value of the series.
///
/// The x axis spans the epochs starting at 1 and is never narrower than one
/// epoch. The y axis gets a 5% margin; a flat series is widened to a unit range.
pub fn chart_ranges(series: &[&[f64]]) -> (Range<f64>, Range<f64>) {
    let epochs = series.iter().map(|values| values.len()).max().unwrap_or(0);
    let x_range = 1.0..(epochs.max(2) as f64);

    let (min, max) = series
        .iter()
        .flat_map(|values| values.iter().copied())
        .filter(|value| value.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
            (min.min(value), max.max(value))
        });

    let y_range = if min > max {
        0.0..1.0
    } else if max - min < f64::EPSILON {
        (min - 0.5)..(max + 0.5)
    } else {
        let margin = (max - min) * 0.05;
        (min - margin)..(max + margin)
    };

    (x_range, y_range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_all_series() {
        let train = [2.0, 1.0, 0.5];
        let valid = [2.5, 1.5];

        let (x, y) = chart_ranges(&[&train, &valid]);

        assert_eq!(x, 1.0..3.0);
        assert!(y.start < 0.5 && y.end > 2.5);
        assert!((y.start - 0.4).abs() < 1e-9);
        assert!((y.end - 2.6).abs() < 1e-9);
    }

    #[test]
    fn single_epoch_flat_series_gets_a_visible_range() {
        let (x, y) = chart_ranges(&[&[0.3], &[0.3]]);

        assert_eq!(x, 1.0..2.0);
        assert!((y.start + 0.2).abs() < 1e-9);
        assert!((y.end - 0.8).abs() < 1e-9);
    }

    #[test]
    fn non_finite_values_are_ignored() {
        let (_, y) = chart_ranges(&[&[f64::NAN, 1.0, 3.0]]);

        assert!(y.start.is_finite() && y.end.is_finite());
        assert!(y.start < 1.0 && y.end > 3.0);
    }

    #[test]
    fn renders_loss_and_accuracy_charts() {
        let dir = tempfile::tempdir().unwrap();
        let history = TrainingHistory {
            train_loss: vec![2.1, 1.4],
            train_accuracy: vec![0.3, 0.55],
            valid_loss: vec![1.9, 1.5],
            valid_accuracy: vec![0.35, 0.5],
        };

        let paths = plot_history(&history, dir.path()).unwrap();

        assert_eq!(
            paths,
            vec![dir.path().join("loss.png"), dir.path().join("accuracy.png")]
        );
        for path in paths {
            let size = std::fs::metadata(&path).unwrap().len();
            assert!(size > 0, "{} is empty", path.display());
        }
    }

    #[test]
    fn empty_history_is_not_plotted() {
        let dir = tempfile::tempdir().unwrap();

        let result = plot_history(&TrainingHistory::default(), dir.path());

        assert!(matches!(result, Err(TransferError::Plot(_))));
    }
}
