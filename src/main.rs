use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use indexmap::IndexMap;
use log::{debug, info, warn};
use nalgebra::DMatrix;
use plotly::common::color::Rgb;
use plotly::common::{Font, HoverInfo, Line, Marker, Mode, Orientation, Position};
use plotly::layout::{Axis, GridPattern, HoverMode, LayoutGrid, Margin};
use plotly::{Bar, Layout, Plot, Scatter};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "safelook")]
#[command(about = "Render SAFE enrichment-score figures from a precomputed network.", long_about = None)]
struct Args {
    /// Which kind of figure to generate.
    #[arg(value_enum, value_name = "MISSION")]
    mission: Mission,

    /// Load the spatial graph artifact (JSON) from this FILE.
    #[arg(short = 'G', long = "graph", value_name = "FILE")]
    graph: Option<PathBuf>,

    /// Write the figure to this FILE.
    #[arg(short = 'O', long = "output", value_name = "FILE")]
    output: PathBuf,

    /// Raw per-node SAFE score artifact (JSON) from the analysis pipeline.
    #[arg(short = 'S', long = "scores", value_name = "FILE")]
    scores: Option<PathBuf>,

    /// One or more SAFE summary tables (CSV).
    #[arg(long = "summary", value_name = "FILE", num_args = 1..)]
    summary: Vec<PathBuf>,

    /// The column to sort and size markers with.
    #[arg(long = "sort", value_name = "NAME", default_value = "SAFE enriched score")]
    sort: String,

    /// p-value below which a score counts as significant.
    #[arg(short = 'p', long = "pvalue", value_name = "FLOAT", default_value_t = 0.05)]
    pvalue: f64,

    /// The file format of the output figure.
    #[arg(long = "format", value_enum, value_name = "FORMAT", default_value = "html")]
    format: OutputFormat,

    /// Set the width in pixels of the output figure.
    #[arg(short = 'x', long = "width", value_name = "N", default_value_t = 1600)]
    width: usize,

    /// Set the height in pixels of the output figure.
    #[arg(short = 'y', long = "height", value_name = "N", default_value_t = 1600)]
    height: usize,

    /// Verbosity level (0 = error, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1)]
    verbose: u8,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Mission {
    Ranking,
    Stratification,
    Ordination,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Html,
    Png,
    Pdf,
}

/// A category must occupy at least this many nodes to be drawn.
const MIN_CATEGORY_NODES: usize = 10;

/// Pixels added to a node's stored size in the stratification map.
const NODE_SIZE_OFFSET: f64 = 5.0;

/// Marker size range for ordination plots.
const ORDINATION_SIZE_RANGE: (f64, f64) = (10.0, 40.0);

/// At most this many ranking subplots (one plotly axis slot each).
const MAX_RANKING_SOURCES: usize = 8;

/// Spatial layout of the network as produced by the upstream pipeline.
#[derive(Debug, Deserialize)]
struct SpatialGraph {
    node_positions: Vec<[f64; 2]>,
    node_sizes: Vec<f64>,
    edges: Vec<[usize; 2]>,
}

/// Raw SAFE scores plus the run parameters they were computed with.
#[derive(Debug, Deserialize)]
struct ScoreArtifact {
    data: IndexMap<String, Vec<f64>>,
    params: ScoreParams,
}

#[derive(Debug, Deserialize)]
struct ScoreParams {
    n_iter: u64,
}

/// An identifier-indexed table with named numeric columns.
#[derive(Debug, Clone)]
struct SummaryTable {
    index: Vec<String>,
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl SummaryTable {
    /// Values of the named column, in row order.
    fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[j]).collect())
    }
}

/// Columns contributed by one summary file, with its sort column resolved
/// up front so a missing column fails at merge time, not at render time.
#[derive(Debug, Clone)]
struct SummarySource {
    name: String,
    columns: Vec<String>,
    sort_column: String,
}

/// Column-wise concatenation of the input summary tables.
#[derive(Debug, Clone)]
struct MergedSummary {
    table: SummaryTable,
    sources: Vec<SummarySource>,
}

fn load_graph(path: &Path) -> Result<SpatialGraph> {
    info!("Loading graph artifact {:?}...", path);
    let file = File::open(path).with_context(|| format!("cannot open graph file {:?}", path))?;
    let graph: SpatialGraph = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("malformed graph artifact {:?}", path))?;
    validate_graph(&graph)?;
    debug!(
        "Graph: {} nodes, {} edges",
        graph.node_positions.len(),
        graph.edges.len()
    );
    Ok(graph)
}

fn validate_graph(graph: &SpatialGraph) -> Result<()> {
    let n = graph.node_positions.len();
    if graph.node_sizes.len() != n {
        bail!(
            "graph has {} node positions but {} node sizes",
            n,
            graph.node_sizes.len()
        );
    }
    for edge in &graph.edges {
        if edge[0] >= n || edge[1] >= n {
            bail!("edge ({}, {}) references a node outside 0..{}", edge[0], edge[1], n);
        }
    }
    Ok(())
}

fn load_scores(path: &Path) -> Result<ScoreArtifact> {
    info!("Loading SAFE score artifact {:?}...", path);
    let file = File::open(path).with_context(|| format!("cannot open score file {:?}", path))?;
    let artifact: ScoreArtifact = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("malformed score artifact {:?}", path))?;
    debug!(
        "Scores: {} categories, n_iter = {}",
        artifact.data.len(),
        artifact.params.n_iter
    );
    Ok(artifact)
}

/// Strip surrounding quotes and whitespace from a CSV cell.
fn clean_cell(cell: &str) -> &str {
    cell.trim().trim_matches('"')
}

/// Parse a delimited summary table. The first header cell names the index
/// column; every data cell must be numeric.
fn load_summary(path: &Path) -> Result<SummaryTable> {
    info!("Loading summary table {:?}...", path);
    let file = File::open(path).with_context(|| format!("cannot open summary file {:?}", path))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let header = lines
        .next()
        .with_context(|| format!("summary file {:?} is empty", path))??;
    let header = header.trim_end_matches('\r');
    let columns: Vec<String> = header
        .split(',')
        .skip(1)
        .map(|c| clean_cell(c).to_string())
        .collect();
    if columns.is_empty() {
        bail!("summary file {:?} has no data columns", path);
    }

    let mut index = Vec::new();
    let mut rows = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for (line_no, line) in lines.enumerate() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let mut cells = line.split(',');
        let id = clean_cell(cells.next().unwrap_or_default()).to_string();
        if !seen.insert(id.clone()) {
            bail!("duplicate index value {:?} in summary file {:?}", id, path);
        }
        let row: Vec<f64> = cells
            .map(|c| {
                clean_cell(c).parse::<f64>().with_context(|| {
                    format!("non-numeric cell {:?} at line {} of {:?}", c, line_no + 2, path)
                })
            })
            .collect::<Result<_>>()?;
        if row.len() != columns.len() {
            bail!(
                "line {} of {:?} has {} values, expected {}",
                line_no + 2,
                path,
                row.len(),
                columns.len()
            );
        }
        index.push(id);
        rows.push(row);
    }

    debug!("Summary {:?}: {} rows, {} columns", path, index.len(), columns.len());
    Ok(SummaryTable { index, columns, rows })
}

/// File basename with the `.csv` suffix stripped.
fn source_name(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    match base.strip_suffix(".csv") {
        Some(stripped) => stripped.to_string(),
        None => base,
    }
}

/// The one column of `columns` whose name starts with the sort prefix.
fn resolve_sort_column(columns: &[String], sort_col: &str, source: &str) -> Result<String> {
    columns
        .iter()
        .find(|c| c.starts_with(sort_col))
        .cloned()
        .with_context(|| {
            format!(
                "summary source {:?} has no column starting with {:?}",
                source, sort_col
            )
        })
}

fn merge_summaries(paths: &[PathBuf], sort_col: &str) -> Result<MergedSummary> {
    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        inputs.push((source_name(path), load_summary(path)?));
    }
    merge_named_summaries(inputs, sort_col)
}

/// Merge one or more summary tables column-wise. A single table is returned
/// unrenamed; multiple tables must share an identical index set and get their
/// column names suffixed with the source name.
fn merge_named_summaries(
    inputs: Vec<(String, SummaryTable)>,
    sort_col: &str,
) -> Result<MergedSummary> {
    if inputs.is_empty() {
        bail!("no summary tables given");
    }

    if inputs.len() == 1 {
        let (name, table) = inputs.into_iter().next().unwrap();
        let sort_column = resolve_sort_column(&table.columns, sort_col, &name)?;
        let source = SummarySource {
            name,
            columns: table.columns.clone(),
            sort_column,
        };
        return Ok(MergedSummary { table, sources: vec![source] });
    }

    let union: FxHashSet<&str> = inputs
        .iter()
        .flat_map(|(_, t)| t.index.iter().map(String::as_str))
        .collect();
    if union.len() != inputs[0].1.index.len() {
        warn!("Different index found between multiple input SAFE summary files...");
        bail!("summary tables do not share an identical index set");
    }

    let index = inputs[0].1.index.clone();
    let mut columns = Vec::new();
    let mut rows: Vec<Vec<f64>> = vec![Vec::new(); index.len()];
    let mut sources = Vec::with_capacity(inputs.len());

    for (name, table) in &inputs {
        let renamed: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} ({})", c, name))
            .collect();
        let sort_column = resolve_sort_column(&renamed, sort_col, name)?;
        sources.push(SummarySource {
            name: name.clone(),
            columns: renamed.clone(),
            sort_column,
        });
        columns.extend(renamed);

        // Align on the first table's row order, not file order.
        for (i, id) in index.iter().enumerate() {
            let pos = table
                .index
                .iter()
                .position(|other| other == id)
                .with_context(|| {
                    format!("index value {:?} is missing from summary source {:?}", id, name)
                })?;
            rows[i].extend_from_slice(&table.rows[pos]);
        }
    }

    Ok(MergedSummary {
        table: SummaryTable { index, columns, rows },
        sources,
    })
}

/// Row order after a stable descending sort by each key column in turn.
fn descending_order(table: &SummaryTable, sort_columns: &[String]) -> Result<Vec<usize>> {
    let mut keys = Vec::with_capacity(sort_columns.len());
    for name in sort_columns {
        keys.push(
            table
                .column(name)
                .with_context(|| format!("sort column {:?} not found", name))?,
        );
    }
    let mut order: Vec<usize> = (0..table.index.len()).collect();
    order.sort_by(|&a, &b| {
        for key in &keys {
            match key[b].partial_cmp(&key[a]) {
                Some(std::cmp::Ordering::Equal) | None => continue,
                Some(ord) => return ord,
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(order)
}

/// Trace axis id for the n-th subplot ("x", "x2", ...).
fn subplot_axis_id(idx: usize) -> String {
    if idx == 0 {
        "x".to_string()
    } else {
        format!("x{}", idx + 1)
    }
}

/// Attach `axis` as the n-th x axis of the layout.
fn with_subplot_axis(layout: Layout, idx: usize, axis: Axis) -> Layout {
    match idx {
        0 => layout.x_axis(axis),
        1 => layout.x_axis2(axis),
        2 => layout.x_axis3(axis),
        3 => layout.x_axis4(axis),
        4 => layout.x_axis5(axis),
        5 => layout.x_axis6(axis),
        6 => layout.x_axis7(axis),
        _ => layout.x_axis8(axis),
    }
}

/// Horizontal bar chart of summary rows ranked by the sort column(s), one
/// subplot per input summary source.
fn draw_ranking(
    merged: &MergedSummary,
    output: &Path,
    format: OutputFormat,
    width: usize,
    height: usize,
) -> Result<()> {
    if merged.sources.len() > MAX_RANKING_SOURCES {
        bail!(
            "ranking supports at most {} summary files, got {}",
            MAX_RANKING_SOURCES,
            merged.sources.len()
        );
    }

    // One joint sort across every source's sort column.
    let sort_columns: Vec<String> = merged
        .sources
        .iter()
        .map(|s| s.sort_column.clone())
        .collect();
    let order = descending_order(&merged.table, &sort_columns)?;

    // Feed rows bottom-up so the highest-ranked row lands at the top.
    let labels: Vec<String> = order
        .iter()
        .rev()
        .map(|&i| merged.table.index[i].clone())
        .collect();

    let mut plot = Plot::new();
    for (idx, source) in merged.sources.iter().enumerate() {
        let values = merged
            .table
            .column(&source.sort_column)
            .with_context(|| format!("sort column {:?} not found", source.sort_column))?;
        let bars: Vec<f64> = order.iter().rev().map(|&i| values[i]).collect();
        plot.add_trace(
            Bar::new(bars, labels.clone())
                .orientation(Orientation::Horizontal)
                .marker(Marker::new().line(Line::new().width(1.0)))
                .show_legend(false)
                .x_axis(subplot_axis_id(idx)),
        );
    }

    let mut layout = Layout::new()
        .width(width)
        .height(height)
        .margin(Margin::new().left(width / 4));
    if merged.sources.len() > 1 {
        layout = layout.grid(
            LayoutGrid::new()
                .rows(1)
                .columns(merged.sources.len())
                .pattern(GridPattern::Coupled)
                .x_gap(0.0),
        );
        for (idx, source) in merged.sources.iter().enumerate() {
            layout = with_subplot_axis(layout, idx, Axis::new().title(source.name.clone()));
        }
    }
    plot.set_layout(layout);

    write_figure(&plot, output, format, width, height)
}

/// Significance threshold on the -log10-scaled score metric: the score a
/// category must exceed for its empirical p-value to beat `p_value` given
/// `n_iter` permutations.
fn significance_threshold(n_iter: u64, p_value: f64) -> f64 {
    let min_p_value = 1.0 / (n_iter as f64 + 1.0);
    p_value.log10() / min_p_value.log10()
}

/// For each node, the index of its highest-scoring category if that score
/// strictly exceeds the threshold. The first category wins ties.
fn assign_nodes(
    scores: &IndexMap<String, Vec<f64>>,
    n_nodes: usize,
    threshold: f64,
) -> Vec<Option<usize>> {
    (0..n_nodes)
        .map(|node| {
            let mut best: Option<(usize, f64)> = None;
            for (cat, (_, values)) in scores.iter().enumerate() {
                let v = values[node];
                if best.map_or(true, |(_, b)| v > b) {
                    best = Some((cat, v));
                }
            }
            best.and_then(|(cat, v)| if v > threshold { Some(cat) } else { None })
        })
        .collect()
}

/// Assigned-node counts per category, dropping categories below the minimum
/// occupancy, in ascending count order. Ties keep first-assignment order.
fn surviving_categories(assignments: &[Option<usize>], n_categories: usize) -> Vec<(usize, usize)> {
    let mut counts = vec![0usize; n_categories];
    let mut first_seen = Vec::new();
    for assigned in assignments.iter().flatten() {
        if counts[*assigned] == 0 {
            first_seen.push(*assigned);
        }
        counts[*assigned] += 1;
    }
    let mut kept: Vec<(usize, usize)> = first_seen
        .into_iter()
        .map(|cat| (cat, counts[cat]))
        .filter(|&(_, count)| count >= MIN_CATEGORY_NODES)
        .collect();
    kept.sort_by_key(|&(_, count)| count);
    kept
}

/// All edges as one multi-segment line trace, with gap breaks between
/// segments.
fn edge_trace(graph: &SpatialGraph) -> Box<Scatter<Option<f64>, Option<f64>>> {
    let mut xs = Vec::with_capacity(graph.edges.len() * 3);
    let mut ys = Vec::with_capacity(graph.edges.len() * 3);
    for edge in &graph.edges {
        xs.push(Some(graph.node_positions[edge[0]][0]));
        xs.push(Some(graph.node_positions[edge[1]][0]));
        xs.push(None);
        ys.push(Some(graph.node_positions[edge[0]][1]));
        ys.push(Some(graph.node_positions[edge[1]][1]));
        ys.push(None);
    }
    Scatter::new(xs, ys)
        .mode(Mode::Lines)
        .line(Line::new().width(1.0).color(Rgb::new(142, 157, 162)))
        .opacity(0.7)
        .show_legend(false)
}

/// Enterotyping-like stratification map: nodes colored by their dominant
/// significant category over the spatial layout.
fn draw_stratification(
    graph: &SpatialGraph,
    scores: &IndexMap<String, Vec<f64>>,
    output: &Path,
    format: OutputFormat,
    n_iter: u64,
    p_value: f64,
    width: usize,
    height: usize,
) -> Result<()> {
    let n_nodes = graph.node_positions.len();
    for (category, values) in scores {
        if values.len() != n_nodes {
            bail!(
                "category {:?} has {} scores but the graph has {} nodes",
                category,
                values.len(),
                n_nodes
            );
        }
    }

    let mut plot = Plot::new();
    plot.add_trace(edge_trace(graph));

    let threshold = significance_threshold(n_iter, p_value);
    debug!(
        "Significance threshold: {:.4} (n_iter = {}, p = {})",
        threshold, n_iter, p_value
    );

    let assignments = assign_nodes(scores, n_nodes, threshold);
    let kept = surviving_categories(&assignments, scores.len());
    if kept.is_empty() {
        warn!("No category passed the significance and occupancy filters");
    }

    for (cat, count) in kept {
        let nodes: Vec<usize> = assignments
            .iter()
            .enumerate()
            .filter(|(_, a)| **a == Some(cat))
            .map(|(node, _)| node)
            .collect();
        let xs: Vec<f64> = nodes.iter().map(|&n| graph.node_positions[n][0]).collect();
        let ys: Vec<f64> = nodes.iter().map(|&n| graph.node_positions[n][1]).collect();
        let sizes: Vec<usize> = nodes
            .iter()
            .map(|&n| (NODE_SIZE_OFFSET + graph.node_sizes[n]).round() as usize)
            .collect();
        let name = scores
            .get_index(cat)
            .map(|(label, _)| label.as_str())
            .unwrap_or_default();
        plot.add_trace(
            Scatter::new(xs, ys)
                .mode(Mode::Markers)
                .marker(Marker::new().size_array(sizes).opacity(0.9))
                .hover_info(HoverInfo::Text)
                .name(format!("{} ({})", name, count))
                .show_legend(true),
        );
    }

    plot.set_layout(
        Layout::new()
            .width(width)
            .height(height)
            .font(Font::new().size(30))
            .hover_mode(HoverMode::Closest),
    );

    write_figure(&plot, output, format, width, height)
}

/// First two principal components plus explained-variance ratios.
struct Pca2d {
    pc1: Vec<f64>,
    pc2: Vec<f64>,
    variance_ratio: [f64; 2],
}

/// PCA over `rows` as observations. Features are mean-centered; components
/// come from the SVD of the centered matrix.
fn pca_2d(rows: &[Vec<f64>]) -> Result<Pca2d> {
    let n = rows.len();
    if n < 2 {
        bail!("PCA needs at least 2 observations, got {}", n);
    }
    let m = rows[0].len();
    if m == 0 {
        bail!("PCA needs at least 1 feature");
    }
    if rows.iter().any(|r| r.len() != m) {
        bail!("PCA observations have inconsistent lengths");
    }

    let mut matrix = DMatrix::from_fn(n, m, |i, j| rows[i][j]);
    for j in 0..m {
        let mean = matrix.column(j).mean();
        for i in 0..n {
            matrix[(i, j)] -= mean;
        }
    }

    let svd = matrix.svd(true, false);
    let u = svd.u.context("SVD did not produce left singular vectors")?;
    let s = svd.singular_values;

    let total: f64 = s.iter().map(|v| v * v).sum();
    let ratio = |k: usize| {
        if k < s.len() && total > 0.0 {
            s[k] * s[k] / total
        } else {
            0.0
        }
    };
    let score = |i: usize, k: usize| if k < s.len() { u[(i, k)] * s[k] } else { 0.0 };

    Ok(Pca2d {
        pc1: (0..n).map(|i| score(i, 0)).collect(),
        pc2: (0..n).map(|i| score(i, 1)).collect(),
        variance_ratio: [ratio(0), ratio(1)],
    })
}

/// Linear min-max scaling of `values` into `[lo, hi]`. A constant input maps
/// everything to `lo`.
fn min_max_scale(values: &[f64], lo: f64, hi: f64) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    values
        .iter()
        .map(|&v| {
            if max > min {
                lo + (v - min) / (max - min) * (hi - lo)
            } else {
                lo
            }
        })
        .collect()
}

/// Ordination plot: categories projected onto the first two principal
/// components of their per-node score profiles, sized by the summary sort
/// column.
fn draw_ordination(
    scores: &IndexMap<String, Vec<f64>>,
    merged: &MergedSummary,
    output: &Path,
    format: OutputFormat,
    width: usize,
    height: usize,
) -> Result<()> {
    // Reorder raw score categories to the summary's index order.
    let mut rows = Vec::with_capacity(merged.table.index.len());
    for label in &merged.table.index {
        let values = scores.get(label).with_context(|| {
            format!(
                "summary index value {:?} is not a category in the raw SAFE scores",
                label
            )
        })?;
        rows.push(values.clone());
    }

    let pca = pca_2d(&rows)?;

    let sort_column = &merged.sources[0].sort_column;
    let sort_values = merged
        .table
        .column(sort_column)
        .with_context(|| format!("sort column {:?} not found", sort_column))?;
    let (lo, hi) = ORDINATION_SIZE_RANGE;
    let sizes: Vec<usize> = min_max_scale(&sort_values, lo, hi)
        .into_iter()
        .map(|v| v.round() as usize)
        .collect();

    let mut plot = Plot::new();
    plot.add_trace(
        Scatter::new(pca.pc1.clone(), pca.pc2.clone())
            .mode(Mode::Markers)
            .marker(Marker::new().size_array(sizes).opacity(0.5))
            .text_array(merged.table.index.clone())
            .show_legend(false),
    );
    // Empty text companion trace kept for interactive label search.
    plot.add_trace(
        Scatter::new(pca.pc1.clone(), pca.pc2.clone())
            .mode(Mode::Text)
            .hover_info(HoverInfo::None)
            .text_position(Position::MiddleCenter)
            .name("name for searching")
            .text_font(Font::new().size(13))
            .text_array(vec![String::new(); pca.pc1.len()])
            .show_legend(false),
    );

    plot.set_layout(
        Layout::new()
            .x_axis(
                Axis::new().title(format!("PC1({:.2}%)", pca.variance_ratio[0] * 100.0)),
            )
            .y_axis(
                Axis::new().title(format!("PC2({:.2}%)", pca.variance_ratio[1] * 100.0)),
            )
            .width(width)
            .height(height)
            .font(Font::new().size(15))
            .hover_mode(HoverMode::Closest),
    );

    write_figure(&plot, output, format, width, height)
}

#[cfg(feature = "static-export")]
fn write_static(
    plot: &Plot,
    output: &Path,
    format: OutputFormat,
    width: usize,
    height: usize,
) -> Result<()> {
    use plotly::ImageFormat;
    let image_format = match format {
        OutputFormat::Png => ImageFormat::PNG,
        _ => ImageFormat::PDF,
    };
    let _ = plot.write_image(output, image_format, width, height, 1.0);
    Ok(())
}

#[cfg(not(feature = "static-export"))]
fn write_static(
    _plot: &Plot,
    _output: &Path,
    _format: OutputFormat,
    _width: usize,
    _height: usize,
) -> Result<()> {
    bail!("png/pdf output requires a build with the static-export feature");
}

fn write_figure(
    plot: &Plot,
    output: &Path,
    format: OutputFormat,
    width: usize,
    height: usize,
) -> Result<()> {
    info!("Saving figure to {:?}...", output);
    match format {
        OutputFormat::Html => {
            plot.write_html(output);
            Ok(())
        }
        OutputFormat::Png | OutputFormat::Pdf => write_static(plot, output, format, width, height),
    }
}

fn require<'a>(path: &'a Option<PathBuf>, flag: &str, mission: &str) -> Result<&'a Path> {
    path.as_deref()
        .with_context(|| format!("{} requires the {} option", mission, flag))
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    match args.mission {
        Mission::Ranking => {
            if args.summary.is_empty() {
                bail!("ranking requires at least one --summary file");
            }
            let merged = merge_summaries(&args.summary, &args.sort)?;
            draw_ranking(&merged, &args.output, args.format, args.width, args.height)?;
        }
        Mission::Stratification => {
            let scores = load_scores(require(&args.scores, "--scores", "stratification")?)?;
            let graph = load_graph(require(&args.graph, "--graph", "stratification")?)?;
            draw_stratification(
                &graph,
                &scores.data,
                &args.output,
                args.format,
                scores.params.n_iter,
                args.pvalue,
                args.width,
                args.height,
            )?;
        }
        Mission::Ordination => {
            if args.summary.is_empty() {
                bail!("ordination requires at least one --summary file");
            }
            let scores = load_scores(require(&args.scores, "--scores", "ordination")?)?;
            let merged = merge_summaries(&args.summary, &args.sort)?;
            if merged.sources.len() != 1 {
                warn!("The number of raw SAFE score artifacts needs to match the number of summary inputs.");
                bail!(
                    "ordination takes exactly one summary file, got {}",
                    merged.sources.len()
                );
            }
            draw_ordination(
                &scores.data,
                &merged,
                &args.output,
                args.format,
                args.width,
                args.height,
            )?;
        }
    }

    info!("Done.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(index: &[&str], columns: &[&str], rows: &[&[f64]]) -> SummaryTable {
        SummaryTable {
            index: index.iter().map(|s| s.to_string()).collect(),
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows: rows.iter().map(|r| r.to_vec()).collect(),
        }
    }

    fn score_map(entries: &[(&str, &[f64])]) -> IndexMap<String, Vec<f64>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn merge_suffixes_columns_and_sums_counts() {
        let a = table(
            &["n1", "n2"],
            &["SAFE enriched score", "extra"],
            &[&[1.0, 2.0], &[3.0, 4.0]],
        );
        let b = table(&["n1", "n2"], &["SAFE enriched score"], &[&[5.0], &[6.0]]);
        let merged = merge_named_summaries(
            vec![("left".to_string(), a), ("right".to_string(), b)],
            "SAFE enriched score",
        )
        .unwrap();

        assert_eq!(
            merged.table.columns,
            vec![
                "SAFE enriched score (left)",
                "extra (left)",
                "SAFE enriched score (right)"
            ]
        );
        assert_eq!(merged.sources[0].sort_column, "SAFE enriched score (left)");
        assert_eq!(merged.sources[1].sort_column, "SAFE enriched score (right)");
        assert_eq!(merged.table.rows[0], vec![1.0, 2.0, 5.0]);
    }

    #[test]
    fn merge_aligns_rows_by_index_label() {
        let a = table(&["n1", "n2"], &["s"], &[&[1.0], &[2.0]]);
        let b = table(&["n2", "n1"], &["s"], &[&[20.0], &[10.0]]);
        let merged =
            merge_named_summaries(vec![("a".to_string(), a), ("b".to_string(), b)], "s").unwrap();
        assert_eq!(merged.table.index, vec!["n1", "n2"]);
        assert_eq!(merged.table.rows[0], vec![1.0, 10.0]);
        assert_eq!(merged.table.rows[1], vec![2.0, 20.0]);
    }

    #[test]
    fn merge_rejects_differing_index_sets() {
        let a = table(&["n1", "n2"], &["s"], &[&[1.0], &[2.0]]);
        let b = table(&["n1", "n3"], &["s"], &[&[1.0], &[2.0]]);
        let result = merge_named_summaries(vec![("a".to_string(), a), ("b".to_string(), b)], "s");
        assert!(result.is_err());
    }

    #[test]
    fn single_summary_keeps_column_names() {
        let a = table(&["n1"], &["SAFE enriched score"], &[&[1.0]]);
        let merged =
            merge_named_summaries(vec![("only".to_string(), a)], "SAFE enriched score").unwrap();
        assert_eq!(merged.table.columns, vec!["SAFE enriched score"]);
        assert_eq!(merged.sources.len(), 1);
        assert_eq!(merged.sources[0].name, "only");
        assert_eq!(merged.sources[0].sort_column, "SAFE enriched score");
    }

    #[test]
    fn merge_requires_sort_column_per_source() {
        let a = table(&["n1"], &["something else"], &[&[1.0]]);
        let result = merge_named_summaries(vec![("a".to_string(), a)], "SAFE enriched score");
        assert!(result.is_err());
    }

    #[test]
    fn threshold_at_min_p_is_one() {
        let n_iter = 999;
        let min_p = 1.0 / (n_iter as f64 + 1.0);
        let t = significance_threshold(n_iter, min_p);
        assert!((t - 1.0).abs() < 1e-12);
    }

    #[test]
    fn threshold_at_p_one_is_zero() {
        let t = significance_threshold(999, 1.0);
        assert!(t.abs() < 1e-12);
    }

    #[test]
    fn nodes_at_or_below_threshold_unassigned() {
        let scores = score_map(&[("a", &[0.5, 0.7, 0.71]), ("b", &[0.1, 0.2, 0.3])]);
        let assignments = assign_nodes(&scores, 3, 0.7);
        assert_eq!(assignments[0], None);
        assert_eq!(assignments[1], None); // exactly at threshold
        assert_eq!(assignments[2], Some(0));
    }

    #[test]
    fn tied_maximum_goes_to_first_category() {
        let scores = score_map(&[("a", &[0.9]), ("b", &[0.9])]);
        let assignments = assign_nodes(&scores, 1, 0.5);
        assert_eq!(assignments[0], Some(0));
    }

    #[test]
    fn small_categories_are_dropped() {
        // Category 0 occupies 12 nodes, category 1 only 9.
        let mut assignments: Vec<Option<usize>> = vec![Some(0); 12];
        assignments.extend(vec![Some(1); 9]);
        assignments.push(None);
        let kept = surviving_categories(&assignments, 2);
        assert_eq!(kept, vec![(0, 12)]);
    }

    #[test]
    fn surviving_categories_sorted_by_ascending_count() {
        let mut assignments: Vec<Option<usize>> = vec![Some(0); 30];
        assignments.extend(vec![Some(1); 10]);
        assignments.extend(vec![Some(2); 20]);
        let kept = surviving_categories(&assignments, 3);
        assert_eq!(kept, vec![(1, 10), (2, 20), (0, 30)]);
    }

    #[test]
    fn no_category_survives_is_empty_not_error() {
        let assignments: Vec<Option<usize>> = vec![None; 50];
        assert!(surviving_categories(&assignments, 4).is_empty());
    }

    #[test]
    fn ranking_order_descending_and_stable() {
        let t = table(
            &["r0", "r1", "r2", "r3"],
            &["s"],
            &[&[1.0], &[3.0], &[3.0], &[2.0]],
        );
        let order = descending_order(&t, &["s".to_string()]).unwrap();
        // Ties (r1, r2) keep input order.
        assert_eq!(order, vec![1, 2, 3, 0]);
    }

    #[test]
    fn ranking_joint_sort_uses_secondary_column() {
        let t = table(
            &["r0", "r1", "r2"],
            &["s (a)", "s (b)"],
            &[&[1.0, 9.0], &[1.0, 2.0], &[1.0, 5.0]],
        );
        let order = descending_order(&t, &["s (a)".to_string(), "s (b)".to_string()]).unwrap();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn min_max_scale_maps_endpoints() {
        let scaled = min_max_scale(&[2.0, 4.0, 8.0], 10.0, 40.0);
        assert!((scaled[0] - 10.0).abs() < 1e-12);
        assert!((scaled[2] - 40.0).abs() < 1e-12);
        assert!(scaled.iter().all(|&v| (10.0..=40.0).contains(&v)));
    }

    #[test]
    fn min_max_scale_constant_input_maps_to_lower_bound() {
        let scaled = min_max_scale(&[3.0, 3.0, 3.0], 10.0, 40.0);
        assert!(scaled.iter().all(|&v| (v - 10.0).abs() < 1e-12));
    }

    #[test]
    fn pca_variance_ratios_bounded() {
        let rows = vec![
            vec![1.0, 2.0, 0.5],
            vec![3.0, 1.0, 0.25],
            vec![2.0, 4.0, 1.0],
            vec![5.0, 3.0, 2.0],
        ];
        let pca = pca_2d(&rows).unwrap();
        let total: f64 = pca.variance_ratio.iter().sum();
        // Three features, so the first two components may not carry all of
        // the variance, but never more than all of it.
        assert!(total <= 1.0 + 1e-9);
        assert!(pca.variance_ratio[0] >= pca.variance_ratio[1]);
    }

    #[test]
    fn pca_captures_dominant_axis() {
        // All variance sits in the first feature.
        let rows = vec![
            vec![0.0, 1.0],
            vec![1.0, 1.0],
            vec![2.0, 1.0],
            vec![3.0, 1.0],
        ];
        let pca = pca_2d(&rows).unwrap();
        assert!((pca.variance_ratio[0] - 1.0).abs() < 1e-9);
        assert!(pca.variance_ratio[1].abs() < 1e-9);
        assert!(pca.pc2.iter().all(|v| v.abs() < 1e-9));
        // Projections keep the spacing of the input.
        let spread: Vec<f64> = pca.pc1.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
        assert!(spread.iter().all(|d| (d - 1.0).abs() < 1e-9));
    }

    #[test]
    fn pca_rejects_single_observation() {
        assert!(pca_2d(&[vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn graph_validation_catches_shape_errors() {
        let bad_sizes = SpatialGraph {
            node_positions: vec![[0.0, 0.0], [1.0, 1.0]],
            node_sizes: vec![1.0],
            edges: vec![],
        };
        assert!(validate_graph(&bad_sizes).is_err());

        let bad_edge = SpatialGraph {
            node_positions: vec![[0.0, 0.0], [1.0, 1.0]],
            node_sizes: vec![1.0, 1.0],
            edges: vec![[0, 2]],
        };
        assert!(validate_graph(&bad_edge).is_err());

        let ok = SpatialGraph {
            node_positions: vec![[0.0, 0.0], [1.0, 1.0]],
            node_sizes: vec![1.0, 1.0],
            edges: vec![[0, 1]],
        };
        assert!(validate_graph(&ok).is_ok());
    }

    #[test]
    fn summary_parsing_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join("safelook_test_summary.csv");
        std::fs::write(&path, "id,SAFE enriched score,other\nn1,1.5,2.0\nn2,0.5,3.0\n").unwrap();
        let t = load_summary(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(t.index, vec!["n1", "n2"]);
        assert_eq!(t.columns, vec!["SAFE enriched score", "other"]);
        assert_eq!(t.rows[0], vec![1.5, 2.0]);
        assert_eq!(t.rows[1], vec![0.5, 3.0]);
    }

    #[test]
    fn summary_parsing_rejects_duplicate_index() {
        let dir = std::env::temp_dir();
        let path = dir.join("safelook_test_dup.csv");
        std::fs::write(&path, "id,s\nn1,1.0\nn1,2.0\n").unwrap();
        let result = load_summary(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn summary_parsing_rejects_non_numeric_cells() {
        let dir = std::env::temp_dir();
        let path = dir.join("safelook_test_nan.csv");
        std::fs::write(&path, "id,s\nn1,abc\n").unwrap();
        let result = load_summary(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn source_name_strips_csv_suffix() {
        assert_eq!(source_name(Path::new("/tmp/run_A.csv")), "run_A");
        assert_eq!(source_name(Path::new("scores.tsv")), "scores.tsv");
    }

    #[test]
    fn edge_trace_breaks_between_segments() {
        let graph = SpatialGraph {
            node_positions: vec![[0.0, 0.0], [1.0, 2.0], [3.0, 4.0]],
            node_sizes: vec![1.0, 1.0, 1.0],
            edges: vec![[0, 1], [1, 2]],
        };
        // Two edges, three entries each (two endpoints plus a gap).
        let trace = edge_trace(&graph);
        let json = serde_json::to_value(&trace).unwrap();
        let xs = json["x"].as_array().unwrap();
        assert_eq!(xs.len(), 6);
        assert!(xs[2].is_null());
        assert!(xs[5].is_null());
    }

    #[test]
    fn score_artifact_requires_n_iter() {
        let with: std::result::Result<ScoreArtifact, _> =
            serde_json::from_str(r#"{"data": {"a": [1.0]}, "params": {"n_iter": 100}}"#);
        assert!(with.is_ok());
        let without: std::result::Result<ScoreArtifact, _> =
            serde_json::from_str(r#"{"data": {"a": [1.0]}, "params": {}}"#);
        assert!(without.is_err());
    }
}
