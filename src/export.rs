/// Export alignment and CSV output
///
/// The primary path truncates every active device's series to the shortest
/// one so that row `i` holds the `i`-th sample of every device. The reference
/// path resamples timestamped series onto an external list of timestamps.
use log::{info, warn};
use std::path::{Path, PathBuf};

use crate::config::Registry;
use crate::error::ExportError;
use crate::models::{Cell, DecodedSample, IntervalReport, PacketFormat, StoredSample};
use crate::store::SampleStore;

/// Matches within this distance use the sample value directly.
pub const REFERENCE_TOLERANCE_MS: i64 = 5;

/// One device's share of the export: its first `row_count` samples.
///
/// The layout comes from the device's registry format, so a device that
/// recorded nothing still contributes its header.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceColumn {
    pub device: String,
    pub format: PacketFormat,
    pub samples: Vec<StoredSample>,
    angle_width: usize,
}

impl DeviceColumn {
    pub fn new(device: impl Into<String>, format: PacketFormat, samples: Vec<StoredSample>) -> Self {
        // Widest angle packet in the exported rows; shorter rows are padded
        let angle_width = samples
            .iter()
            .map(|s| match &s.sample {
                DecodedSample::Angle(a) => a.angles.len(),
                _ => 0,
            })
            .max()
            .unwrap_or(0);
        Self {
            device: device.into(),
            format,
            samples,
            angle_width,
        }
    }

    /// Axis names for this device, in cell order.
    pub fn axes(&self) -> Vec<String> {
        let fixed: &[&str] = match self.format {
            PacketFormat::NineAxis => &["ax", "ay", "az", "gx", "gy", "gz", "mx", "my", "mz"],
            PacketFormat::SixAxisTimestamped => &["time", "ax", "ay", "az", "gx", "gy", "gz"],
            PacketFormat::IntervalDual => &["accel_gyro_interval", "mag_interval"],
            PacketFormat::IntervalGrouped => &["interval"],
            PacketFormat::Angle => {
                let mut axes = vec!["time".to_string()];
                axes.extend((0..self.angle_width).map(|i| format!("angle{}", i)));
                return axes;
            }
        };
        fixed.iter().map(|s| s.to_string()).collect()
    }

    /// Header names: the bare device name for a single untimestamped value,
    /// `<device>_<axis>` otherwise.
    pub fn headers(&self) -> Vec<String> {
        let axes = self.axes();
        if axes.len() == 1 && !self.format.is_timestamped() {
            return vec![self.device.clone()];
        }
        axes.iter()
            .map(|axis| format!("{}_{}", self.device, axis))
            .collect()
    }

    /// Cells for row `index`.
    pub fn cells(&self, index: usize) -> Vec<Cell> {
        self.samples
            .get(index)
            .map(|s| sample_cells(s, self.angle_width))
            .unwrap_or_default()
    }
}

fn time_cell(sample: &StoredSample) -> Cell {
    sample.aligned_ms.map(Cell::Int).unwrap_or(Cell::Empty)
}

fn sample_cells(stored: &StoredSample, angle_width: usize) -> Vec<Cell> {
    let ints = |values: &[i16]| values.iter().map(|v| Cell::Int(i64::from(*v))).collect::<Vec<_>>();
    match &stored.sample {
        DecodedSample::NineAxis(r) => [ints(&r.accel[..]), ints(&r.gyro[..]), ints(&r.mag[..])].concat(),
        DecodedSample::SixAxis(r) => {
            let mut cells = vec![time_cell(stored)];
            cells.extend(ints(&r.accel[..]));
            cells.extend(ints(&r.gyro[..]));
            cells
        }
        DecodedSample::Interval(IntervalReport::Dual {
            accel_gyro_ms,
            mag_ms,
        }) => vec![
            Cell::Int(i64::from(*accel_gyro_ms)),
            Cell::Int(i64::from(*mag_ms)),
        ],
        DecodedSample::Interval(IntervalReport::Grouped { interval_ms }) => {
            vec![Cell::Int(i64::from(*interval_ms))]
        }
        DecodedSample::Angle(r) => {
            let mut cells = vec![time_cell(stored)];
            cells.extend((0..angle_width).map(|i| r.angles.get(i).map_or(Cell::Empty, |v| Cell::Float(*v))));
            cells
        }
    }
}

/// Aligned export for one session, built once from the frozen store.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTable {
    pub columns: Vec<DeviceColumn>,
    pub row_count: usize,
    pub checkpoint_ms: i64,
    pub stop_ms: i64,
}

impl ExportTable {
    pub fn header(&self) -> Vec<String> {
        self.columns.iter().flat_map(|c| c.headers()).collect()
    }

    pub fn rows(&self) -> Vec<Vec<Cell>> {
        (0..self.row_count)
            .map(|i| self.columns.iter().flat_map(|c| c.cells(i)).collect())
            .collect()
    }

    pub fn column(&self, device: &str) -> Option<&DeviceColumn> {
        self.columns.iter().find(|c| c.device == device)
    }
}

/// Truncate every active device's series to the shortest one
///
/// Active devices are those the store holds a series for. A device that
/// recorded nothing makes the table empty but keeps its header columns.
///
/// # Arguments
/// * `registry` - Recognized devices; fixes column order and layout
/// * `store` - Frozen per-device series for the session
/// * `checkpoint_ms` - Streaming start, ms after connect
/// * `stop_ms` - Streaming stop, ms after connect
///
/// # Returns
/// An `ExportTable` whose row `i` holds the `i`-th sample of every active device
pub fn align_export(
    registry: &Registry,
    store: &SampleStore,
    checkpoint_ms: i64,
    stop_ms: i64,
) -> ExportTable {
    let active: Vec<_> = registry
        .iter()
        .filter_map(|profile| store.series(&profile.name).map(|series| (profile.format, series)))
        .collect();

    let row_count = active.iter().map(|(_, s)| s.len()).min().unwrap_or(0);
    for (_, series) in &active {
        if series.len() > row_count {
            info!(
                "Discarding {} trailing samples from {}",
                series.len() - row_count,
                series.device
            );
        }
    }

    let columns = active
        .into_iter()
        .map(|(format, series)| {
            DeviceColumn::new(series.device.clone(), format, series.samples[..row_count].to_vec())
        })
        .collect();

    ExportTable {
        columns,
        row_count,
        checkpoint_ms,
        stop_ms,
    }
}

fn write_rows(path: &Path, header: &[String], rows: &[Vec<Cell>]) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row.iter().map(|c| c.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the table as CSV: header row, then one row per aligned index.
pub fn write_csv(table: &ExportTable, path: &Path) -> Result<(), ExportError> {
    let header = table.header();
    write_rows(path, &header, &table.rows())?;
    info!(
        "Exported {} rows x {} columns to {}",
        table.row_count,
        header.len(),
        path.display()
    );
    Ok(())
}

/// Resample `(timestamp, value)` points onto `reference` timestamps
///
/// A reference timestamp takes the value of the closest unused point when it
/// lies within `tolerance_ms` (ties go to the earlier point) and that point is
/// not offered again. Otherwise the value is interpolated linearly between the
/// bracketing points, clamped to the first/last point outside the series.
///
/// # Arguments
/// * `points` - Host-relative timestamps and values of one device axis
/// * `reference` - Timestamps to resample onto, in the same time base
/// * `tolerance_ms` - Largest distance at which a point is used directly
///
/// # Returns
/// One value per reference timestamp, `None` only when `points` is empty
pub fn align_to_reference(points: &[(i64, f64)], reference: &[i64], tolerance_ms: i64) -> Vec<Option<f64>> {
    let mut pool: Vec<usize> = (0..points.len()).collect();
    let mut sorted = points.to_vec();
    sorted.sort_by_key(|(t, _)| *t);

    reference
        .iter()
        .map(|&r| {
            let closest = pool
                .iter()
                .enumerate()
                .min_by_key(|&(_, &i)| (points[i].0 - r).abs());
            if let Some((slot, &i)) = closest {
                if (points[i].0 - r).abs() <= tolerance_ms {
                    pool.remove(slot);
                    return Some(points[i].1);
                }
            }
            interpolate(&sorted, r)
        })
        .collect()
}

fn interpolate(sorted: &[(i64, f64)], t: i64) -> Option<f64> {
    let first = sorted.first()?;
    let last = sorted.last()?;
    if t <= first.0 {
        return Some(first.1);
    }
    if t >= last.0 {
        return Some(last.1);
    }
    let hi = sorted.partition_point(|(ts, _)| *ts <= t);
    let (t0, v0) = sorted[hi - 1];
    let (t1, v1) = sorted[hi];
    let fraction = (t - t0) as f64 / (t1 - t0) as f64;
    Some(v0 + (v1 - v0) * fraction)
}

fn cell_value(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Int(v) => Some(*v as f64),
        Cell::Float(v) => Some(*v),
        Cell::Empty => None,
    }
}

/// Resample every timestamped device axis onto the reference timestamps.
///
/// Returns the header and rows of the reference table; the first column is
/// the reference timestamp.
pub fn reference_table(table: &ExportTable, reference: &[i64]) -> (Vec<String>, Vec<Vec<Cell>>) {
    let mut header = vec!["reference_time".to_string()];
    let mut columns: Vec<Vec<Option<f64>>> = Vec::new();

    for column in &table.columns {
        if !column.format.is_timestamped() {
            continue;
        }
        let axes = column.axes();
        let rows: Vec<(i64, Vec<Cell>)> = column
            .samples
            .iter()
            .filter_map(|s| s.aligned_ms.map(|t| (t, sample_cells(s, column.angle_width))))
            .collect();

        for (axis_index, axis) in axes.iter().enumerate().skip(1) {
            let points: Vec<(i64, f64)> = rows
                .iter()
                .filter_map(|(t, cells)| cells.get(axis_index).and_then(cell_value).map(|v| (*t, v)))
                .collect();
            header.push(format!("{}_{}", column.device, axis));
            columns.push(align_to_reference(&points, reference, REFERENCE_TOLERANCE_MS));
        }
    }

    let rows = reference
        .iter()
        .enumerate()
        .map(|(i, &r)| {
            let mut row = vec![Cell::Int(r)];
            row.extend(columns.iter().map(|c| c[i].map_or(Cell::Empty, Cell::Float)));
            row
        })
        .collect();
    (header, rows)
}

/// Read reference timestamps from the first column of a CSV file.
///
/// A non-numeric first row is treated as a header.
pub fn read_reference_timestamps(path: &Path) -> Result<Vec<i64>, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut timestamps = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let Some(field) = record.get(0).map(str::trim) else {
            continue;
        };
        if field.is_empty() {
            continue;
        }
        match field.parse::<i64>() {
            Ok(ts) => timestamps.push(ts),
            Err(_) if line == 0 => continue,
            Err(_) => return Err(ExportError::ReferenceTimestamp(field.to_string())),
        }
    }
    Ok(timestamps)
}

/// Write the reference comparison next to the main export.
pub fn write_reference_csv(
    table: &ExportTable,
    reference: &[i64],
    path: &Path,
) -> Result<(), ExportError> {
    let (header, rows) = reference_table(table, reference);
    if header.len() == 1 {
        warn!("No timestamped device columns to compare against reference timestamps");
    }
    write_rows(path, &header, &rows)?;
    info!("Exported reference comparison to {}", path.display());
    Ok(())
}

/// Companion file name for the reference comparison.
pub fn reference_path(export_path: &Path) -> PathBuf {
    let stem = export_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "imu_session".to_string());
    export_path.with_file_name(format!("{}_reference.csv", stem))
}
