use ordered_float::OrderedFloat;
use pathfinding::prelude::{kuhn_munkres_min, Matrix};

/// Cost assigned to infeasible pairings. Large enough that the solver only
/// picks such a pair when a row has no feasible column at all; callers gate
/// the returned pairs against this.
pub const INFEASIBLE: f64 = 1e6;

/// Solve a rectangular minimum-cost assignment.
///
/// `cost` is indexed `[row][col]`. Returns `(row, col)` pairs for every
/// assigned row whose cost is below [`INFEASIBLE`]; rows and columns left
/// over by the rectangular shape stay unassigned.
pub fn min_cost_assignment(cost: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let nrows = cost.len();
    let ncols = cost.first().map(|r| r.len()).unwrap_or(0);
    if nrows == 0 || ncols == 0 {
        return vec![];
    }

    // kuhn_munkres requires at least as many columns as rows; transpose the
    // matrix when detections are fewer than tracks.
    let transpose = nrows > ncols;
    let (r, c) = if transpose { (ncols, nrows) } else { (nrows, ncols) };

    let values: Vec<OrderedFloat<f64>> = (0..r)
        .flat_map(|i| {
            (0..c).map(move |j| {
                let v = if transpose { cost[j][i] } else { cost[i][j] };
                OrderedFloat(v)
            })
        })
        .collect();
    let weights = match Matrix::from_vec(r, c, values) {
        Ok(m) => m,
        Err(_) => return vec![],
    };

    let (_total, assignment) = kuhn_munkres_min(&weights);

    assignment
        .into_iter()
        .enumerate()
        .filter_map(|(row, col)| {
            let (orig_row, orig_col) = if transpose { (col, row) } else { (row, col) };
            if cost[orig_row][orig_col] < INFEASIBLE {
                Some((orig_row, orig_col))
            } else {
                None
            }
        })
        .collect()
}
