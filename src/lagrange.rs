use blstrs::Scalar;
use ff::Field;
use group::Group;

use crate::types::Error;

pub fn lagrange_coefficients_at_zero(xs: &[Scalar]) -> Result<Vec<Scalar>, Error> {
    if xs.is_empty() {
        return Err(Error::InvalidParams("no interpolation points".into()));
    }
    let mut coeffs = Vec::with_capacity(xs.len());
    for (i, x_i) in xs.iter().enumerate() {
        let mut num = Scalar::ONE;
        let mut den = Scalar::ONE;
        for (j, x_j) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            num *= -*x_j;
            den *= *x_i - x_j;
        }
        // A zero denominator means two points share an x coordinate.
        let den_inv = Option::<Scalar>::from(den.invert())
            .ok_or_else(|| Error::InvalidParams("duplicate interpolation point".into()))?;
        coeffs.push(num * den_inv);
    }
    Ok(coeffs)
}

/// Interpolates group elements `values` taken at `xs` back to x = 0.
pub fn combine_at_zero<G>(xs: &[Scalar], values: &[G]) -> Result<G, Error>
where
    G: Group<Scalar = Scalar>,
{
    if xs.len() != values.len() {
        return Err(Error::InvalidParams(format!(
            "{} points for {} values",
            xs.len(),
            values.len()
        )));
    }
    let coeffs = lagrange_coefficients_at_zero(xs)?;
    let mut acc = G::identity();
    for (coeff, value) in coeffs.iter().zip(values.iter()) {
        acc += *value * coeff;
    }
    Ok(acc)
}
