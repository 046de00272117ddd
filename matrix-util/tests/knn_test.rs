use matrix_util::knn_match::*;
use nalgebra::DMatrix;

fn line_points(nn: usize) -> DMatrix<f32> {
    DMatrix::from_fn(2, nn, |i, j| if i == 0 { j as f32 } else { 0.0 })
}

#[test]
fn exact_search_finds_closest() -> anyhow::Result<()> {
    let points = line_points(20);
    let names = (0..20).collect::<Vec<usize>>();
    let dict = ColumnDict::from_dmatrix_columns(&points, names, &ColumnDictArgs::default())?;
    assert!(dict.is_exact());

    let (idx, dist) = dict.search_others(&10, 2)?;
    assert_eq!(idx, vec![9, 11]);
    assert_eq!(dist, vec![1.0, 1.0]);

    let (idx, _) = dict.search_point(&vec![3.2_f32, 0.0].to_vp(), 3);
    assert_eq!(idx, vec![3, 4, 2]);
    Ok(())
}

#[test]
fn match_against_other_dictionary() -> anyhow::Result<()> {
    let left = line_points(5);
    let right = line_points(10).map(|x| x + 0.25);

    let left_dict = ColumnDict::from_dmatrix_columns(
        &left,
        (0..5).map(|j| format!("L{}", j)).collect(),
        &ColumnDictArgs::default(),
    )?;
    let right_dict = ColumnDict::from_dmatrix_columns(
        &right,
        (0..10).map(|j| format!("R{}", j)).collect(),
        &ColumnDictArgs::default(),
    )?;

    let matched = left_dict.match_against_by_name(&"L2".to_string(), 1, &right_dict)?;
    assert_eq!(matched, vec!["R2".to_string()]);
    Ok(())
}

#[test]
fn approximate_search_returns_k() -> anyhow::Result<()> {
    let nn = 300;
    let points = DMatrix::from_fn(3, nn, |i, j| ((i + 1) * j % 17) as f32 + j as f32 * 0.01);
    let args = ColumnDictArgs {
        exact_below: 100,
        ..Default::default()
    };
    let dict = ColumnDict::from_dmatrix_columns(&points, (0..nn).collect::<Vec<_>>(), &args)?;
    assert!(!dict.is_exact());

    let (idx, dist) = dict.search_others_by_index(0, 10);
    assert_eq!(idx.len(), 10);
    assert!(!idx.contains(&0));
    assert!(dist.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[test]
fn duplicate_names_are_rejected() {
    let points = line_points(3);
    let ret = ColumnDict::from_dmatrix_columns(&points, vec![1, 1, 2], &ColumnDictArgs::default());
    assert!(ret.is_err());
}

#[test]
fn batch_searches_with_string_names() -> anyhow::Result<()> {
    let left = ColumnDict::from_dmatrix_columns(
        &line_points(5),
        (0..5).map(|j| format!("L{}", j)).collect(),
        &ColumnDictArgs::default(),
    )?;
    let right = ColumnDict::from_dmatrix_columns(
        &line_points(10).map(|x| x + 0.25),
        (0..10).map(|j| format!("R{}", j)).collect(),
        &ColumnDictArgs::default(),
    )?;

    let across = left.search_all_against(1, &right);
    assert_eq!(across.len(), 5);
    for (j, (idx, _)) in across.iter().enumerate() {
        assert_eq!(idx, &vec![j]);
    }

    let within = right.search_all_others(2);
    assert_eq!(within.len(), 10);
    assert_eq!(within[0].0, vec![1, 2]);
    assert_eq!(within[5].0, vec![4, 6]);
    Ok(())
}
