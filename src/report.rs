//! SVGレポート出力
//!
//! 混同行列のヒートマップと学習曲線（精度・損失）をSVGで書き出します。

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::metrics::ConfusionMatrix;
use crate::ml::training::TrainingHistory;

const FONT: &str = "Arial, sans-serif";
const COLOR_TEXT: &str = "#2c3e50";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TRAIN: &str = "#3498db";
const COLOR_VALID: &str = "#e67e22";
const COLOR_PHASE: &str = "#e74c3c";

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// 0 → 白, 1 → 濃い青
fn blues(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let lerp = |from: f64, to: f64| (from + (to - from) * t).round() as u8;
    format!("#{:02x}{:02x}{:02x}", lerp(247.0, 8.0), lerp(251.0, 48.0), lerp(255.0, 107.0))
}

fn text(svg: &mut String, x: f64, y: f64, size: u32, anchor: &str, fill: &str, content: &str) {
    svg.push_str(&format!(
        r#"<text x="{:.1}" y="{:.1}" text-anchor="{}" font-family="{}" font-size="{}" fill="{}">{}</text>"#,
        x, y, anchor, FONT, size, fill, escape_xml(content)
    ));
}

/// 混同行列のSVGを生成
pub fn confusion_matrix_svg(cm: &ConfusionMatrix) -> String {
    let n = cm.num_classes();
    let cell = 70.0;
    let left = 170.0;
    let top = 70.0;
    let bottom = 150.0;
    let width = left + cell * n as f64 + 40.0;
    let height = top + cell * n as f64 + bottom;
    let max_count = cm
        .rows()
        .iter()
        .flat_map(|row| row.iter().copied())
        .max()
        .unwrap_or(0)
        .max(1);

    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}">"#,
        w = width,
        h = height
    );
    svg.push_str(&format!(r#"<rect width="{}" height="{}" fill="white"/>"#, width, height));
    text(&mut svg, width / 2.0, 35.0, 18, "middle", COLOR_TEXT, "Confusion Matrix");

    for (i, row) in cm.rows().iter().enumerate() {
        for (j, &count) in row.iter().enumerate() {
            let x = left + cell * j as f64;
            let y = top + cell * i as f64;
            let t = count as f64 / max_count as f64;
            svg.push_str(&format!(
                r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}" stroke="white"/>"#,
                x, y, cell, cell, blues(t)
            ));
            let fill = if t > 0.5 { "white" } else { COLOR_TEXT };
            text(&mut svg, x + cell / 2.0, y + cell / 2.0 + 5.0, 14, "middle", fill, &count.to_string());
        }
    }

    for (i, label) in cm.labels().iter().enumerate() {
        let y = top + cell * i as f64 + cell / 2.0 + 4.0;
        text(&mut svg, left - 10.0, y, 12, "end", COLOR_TEXT, label);

        let x = left + cell * i as f64 + cell / 2.0;
        let y = top + cell * n as f64 + 15.0;
        svg.push_str(&format!(
            r#"<text x="{x:.1}" y="{y:.1}" text-anchor="end" font-family="{}" font-size="12" fill="{}" transform="rotate(-45 {x:.1} {y:.1})">{}</text>"#,
            FONT,
            COLOR_TEXT,
            escape_xml(label),
            x = x,
            y = y
        ));
    }

    text(&mut svg, left + cell * n as f64 / 2.0, height - 15.0, 14, "middle", COLOR_TEXT, "Predicted Label");
    let mid_y = top + cell * n as f64 / 2.0;
    svg.push_str(&format!(
        r#"<text x="20" y="{y:.1}" text-anchor="middle" font-family="{}" font-size="14" fill="{}" transform="rotate(-90 20 {y:.1})">True Label</text>"#,
        FONT,
        COLOR_TEXT,
        y = mid_y
    ));

    svg.push_str("</svg>");
    svg
}

pub fn write_confusion_matrix_svg(cm: &ConfusionMatrix, path: &Path) -> Result<()> {
    fs::write(path, confusion_matrix_svg(cm))
        .with_context(|| format!("Failed to write {}", path.display()))
}

struct Panel<'a> {
    title: &'a str,
    train: Vec<(f64, f64)>,
    valid: Vec<(f64, f64)>,
}

fn draw_panel(svg: &mut String, panel: &Panel, x0: f64, y0: f64, w: f64, h: f64, phase_at: Option<f64>) {
    let points = panel.train.iter().chain(&panel.valid).filter(|(_, y)| y.is_finite());
    let (x_min, x_max, y_max) = points.fold((f64::MAX, f64::MIN, 0.0f64), |(a, b, c), &(x, y)| {
        (a.min(x), b.max(x), c.max(y))
    });
    if x_min > x_max {
        return;
    }
    let x_span = (x_max - x_min).max(1.0);
    let y_max = if y_max > 0.0 { y_max * 1.05 } else { 1.0 };
    let px = |x: f64| x0 + (x - x_min) / x_span * w;
    let py = |y: f64| y0 + h - y / y_max * h;

    text(svg, x0 + w / 2.0, y0 - 15.0, 15, "middle", COLOR_TEXT, panel.title);

    for i in 0..=4 {
        let value = y_max * i as f64 / 4.0;
        let y = py(value);
        svg.push_str(&format!(
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="1"/>"#,
            x0, y, x0 + w, y, COLOR_GRID
        ));
        text(svg, x0 - 8.0, y + 4.0, 11, "end", COLOR_TEXT, &format!("{:.2}", value));
    }
    svg.push_str(&format!(
        r#"<polyline points="{:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="none" stroke="{}" stroke-width="2"/>"#,
        x0, y0, x0, y0 + h, x0 + w, y0 + h, COLOR_AXIS
    ));
    text(svg, x0 + w / 2.0, y0 + h + 30.0, 12, "middle", COLOR_TEXT, "Epoch");

    for (series, color) in [(&panel.train, COLOR_TRAIN), (&panel.valid, COLOR_VALID)] {
        let path: Vec<String> = series
            .iter()
            .filter(|(_, y)| y.is_finite())
            .map(|&(x, y)| format!("{:.1},{:.1}", px(x), py(y)))
            .collect();
        if !path.is_empty() {
            svg.push_str(&format!(
                r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"/>"#,
                path.join(" "),
                color
            ));
        }
    }

    if let Some(epoch) = phase_at {
        let x = px(epoch);
        svg.push_str(&format!(
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="1.5" stroke-dasharray="6,4"/>"#,
            x, y0, x, y0 + h, COLOR_PHASE
        ));
        text(svg, x + 4.0, y0 + 14.0, 11, "start", COLOR_PHASE, "Fine-tuning");
    }
}

/// 学習曲線（精度・損失の2面）を生成
///
/// ファインチューニング開始エポックに縦線を引きます。
pub fn history_svg(history: &TrainingHistory) -> String {
    let width = 1000.0;
    let height = 420.0;
    let epochs = &history.epochs;
    let series = |f: fn(&crate::ml::training::EpochRecord) -> f64| -> Vec<(f64, f64)> {
        epochs.iter().map(|r| (r.epoch as f64, f(r))).collect()
    };

    let accuracy = Panel {
        title: "Accuracy",
        train: series(|r| r.accuracy),
        valid: series(|r| r.val_accuracy),
    };
    let loss = Panel {
        title: "Loss",
        train: series(|r| r.loss),
        valid: series(|r| r.val_loss),
    };
    // 前フェーズ最終エポックとの境界
    let phase_at = history.fine_tune_start().map(|e| e as f64 - 0.5);

    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}">"#,
        w = width,
        h = height
    );
    svg.push_str(&format!(r#"<rect width="{}" height="{}" fill="white"/>"#, width, height));
    draw_panel(&mut svg, &accuracy, 70.0, 60.0, 380.0, 280.0, phase_at);
    draw_panel(&mut svg, &loss, 570.0, 60.0, 380.0, 280.0, phase_at);

    // 凡例
    for (i, (name, color)) in [("train", COLOR_TRAIN), ("validation", COLOR_VALID)].iter().enumerate() {
        let x = 380.0 + i as f64 * 140.0;
        svg.push_str(&format!(
            r#"<line x1="{:.1}" y1="400" x2="{:.1}" y2="400" stroke="{}" stroke-width="3"/>"#,
            x,
            x + 25.0,
            color
        ));
        text(&mut svg, x + 32.0, 404.0, 12, "start", COLOR_TEXT, name);
    }

    svg.push_str("</svg>");
    svg
}

pub fn write_history_svg(history: &TrainingHistory, path: &Path) -> Result<()> {
    fs::write(path, history_svg(history)).with_context(|| format!("Failed to write {}", path.display()))
}
