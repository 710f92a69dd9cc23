use nalgebra::Vector3;

/// Unit vector from `origin` toward `target`.
#[inline]
pub fn unit_toward(origin: &Vector3<f64>, target: &Vector3<f64>) -> Vector3<f64> {
    (target - origin).normalize()
}

/// The component of `v` perpendicular to the unit vector `axis`, normalized.
#[inline]
pub fn perpendicular_unit(v: &Vector3<f64>, axis: &Vector3<f64>) -> Vector3<f64> {
    (v - axis * v.dot(axis)).normalize()
}
