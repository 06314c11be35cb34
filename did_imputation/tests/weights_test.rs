use did_imputation::{DidImputationBuilder, FirstStage, Selection};
use polars::prelude::*;

fn weighted_panel() -> PolarsResult<DataFrame> {
    // Unit 3 carries four times the weight of the others.
    df!(
        "id" => &[1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4],
        "year" => &[1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3],
        "g" => &[0, 0, 0, 2, 2, 2, 2, 2, 2, 0, 0, 0],
        "w" => &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 4.0, 4.0, 4.0, 1.0, 1.0, 1.0],
        "y" => &[1.0, 1.5, 2.2, 0.4, 2.9, 3.4, 1.1, 2.0, 2.9, 0.8, 1.2, 1.7]
    )
}

#[test]
fn test_weighted_estimate_is_weighted_mean_of_effects() -> Result<(), Box<dyn std::error::Error>> {
    let results = DidImputationBuilder::new(weighted_panel()?, "y", "id", "year", "g")
        .weights("w")
        .full_output(true)
        .run()?;
    let panel = results.panel().as_ref().expect("augmented panel");

    let treat = panel.column("treat")?.bool()?;
    let residual = panel.column("residual")?.f64()?;
    let w = panel.column("w")?.f64()?;
    let (num, den) = treat
        .into_iter()
        .zip(residual.into_iter().zip(w.into_iter()))
        .filter(|(d, _)| d.unwrap_or(false))
        .fold((0.0, 0.0), |(num, den), (_, (r, w))| {
            let (r, w) = (r.unwrap_or(f64::NAN), w.unwrap_or(f64::NAN));
            (num + w * r, den + w)
        });

    let treat_term = results.term("treat").expect("static term");
    assert!((treat_term.estimate() - num / den).abs() < 1e-10);

    // The built weights sum to one across treated rows.
    let built: f64 = panel.column("weight_treat")?.f64()?.into_iter().flatten().sum();
    assert!((built - 1.0).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_unit_weights_match_unweighted_run() -> Result<(), Box<dyn std::error::Error>> {
    let mut df = weighted_panel()?;
    df.with_column(Series::new("one".into(), vec![1.0; 12]))?;

    let weighted = DidImputationBuilder::new(df.clone(), "y", "id", "year", "g")
        .weights("one")
        .horizon(Selection::All)
        .run()?;
    let plain = DidImputationBuilder::new(df, "y", "id", "year", "g")
        .horizon(Selection::All)
        .run()?;

    for (a, b) in weighted.terms().iter().zip(plain.terms()) {
        assert_eq!(a.term(), b.term());
        assert!((a.estimate() - b.estimate()).abs() < 1e-10);
        assert!((a.std_error() - b.std_error()).abs() < 1e-10);
    }
    Ok(())
}

#[test]
fn test_negative_weights_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut df = weighted_panel()?;
    df.with_column(Series::new(
        "bad".into(),
        vec![1.0, 1.0, -1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
    ))?;
    let result = DidImputationBuilder::new(df, "y", "id", "year", "g")
        .weights("bad")
        .run();
    assert!(result.is_err());
    Ok(())
}

#[test]
fn test_missing_outcomes_are_dropped() -> Result<(), Box<dyn std::error::Error>> {
    let df = df!(
        "id" => &[1, 1, 1, 2, 2, 2, 3, 3, 3],
        "year" => &[1, 2, 3, 1, 2, 3, 1, 2, 3],
        "g" => &[None, None, None, Some(2), Some(2), Some(2), None, None, None],
        "y" => &[Some(1.0), Some(1.4), None, Some(0.5), Some(2.4), Some(2.6), Some(1.5), Some(2.0), Some(2.4)]
    )?;
    let results = DidImputationBuilder::new(df, "y", "id", "year", "g")
        .first_stage(FirstStage::default())
        .run()?;
    assert_eq!(*results.n_obs(), 8);
    assert_eq!(*results.n_treated(), 2);
    Ok(())
}
