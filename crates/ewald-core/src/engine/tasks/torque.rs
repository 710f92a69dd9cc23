//! Projection of multipole torques onto the frame-defining atoms.
//!
//! A torque on an oriented multipole is equivalent to forces on the atoms
//! that define its local frame. The projection resolves the torque along the
//! frame axes (u toward the first axis atom, v toward the second, w either
//! their cross product or the third axis atom) and distributes dφ/du-style
//! increments with the appropriate lever arms.

use nalgebra::Vector3;

use crate::core::models::atom::Atom;
use crate::core::models::multipole::FrameDefinition;

/// Projects the torque on atom `i` into forces, delivered through `deposit`
/// as `(atom index, force increment)`. Sites with fewer than two axis atoms
/// (ions) produce nothing.
pub(crate) fn project(
    i: usize,
    atom: &Atom,
    coords: &[Vector3<f64>],
    torque: &Vector3<f64>,
    deposit: &mut impl FnMut(usize, Vector3<f64>),
) {
    if atom.axis_atoms.len() < 2 {
        return;
    }
    let ia = atom.axis_atoms[0];
    let ic = atom.axis_atoms[1];
    let origin = coords[i];

    let u_full = coords[ia] - origin;
    let v_full = coords[ic] - origin;
    let (w_full, id) = match atom.frame {
        FrameDefinition::ZThenBisector | FrameDefinition::Threefold => {
            let id = atom.axis_atoms[2];
            (coords[id] - origin, Some(id))
        }
        _ => (u_full.cross(&v_full), None),
    };

    let ru = u_full.norm();
    let rv = v_full.norm();
    let rw = w_full.norm();
    let u = u_full / ru;
    let v = v_full / rv;
    let w = w_full / rw;

    let uv = v.cross(&u).normalize();
    let uw = w.cross(&u).normalize();
    let vw = w.cross(&v).normalize();

    let uvcos = u.dot(&v);
    let uvsin = (1.0 - uvcos * uvcos).sqrt();

    let dphidu = -torque.dot(&u);
    let dphidv = -torque.dot(&v);
    let dphidw = -torque.dot(&w);

    match atom.frame {
        FrameDefinition::ZThenBisector | FrameDefinition::Threefold => {
            // Resolve the bisector contribution through the auxiliary (r, s)
            // frame spanning v + w and its perpendicular in the u plane.
            let r = (v + w).normalize();
            let s = u.cross(&r).normalize();
            let ur = r.cross(&u).normalize();
            let us = s.cross(&u).normalize();

            let urcos = u.dot(&r);
            let ursin = (1.0 - urcos * urcos).sqrt();
            let vscos = v.dot(&s);
            let vssin = (1.0 - vscos * vscos).sqrt();
            let wscos = w.dot(&s);
            let wssin = (1.0 - wscos * wscos).sqrt();

            // Projections of v and w onto the ru plane.
            let t1 = (v - s * vscos).normalize();
            let t2 = (w - s * wscos).normalize();
            let ut1cos = u.dot(&t1);
            let ut1sin = (1.0 - ut1cos * ut1cos).sqrt();
            let ut2cos = u.dot(&t2);
            let ut2sin = (1.0 - ut2cos * ut2cos).sqrt();

            let dphidr = -torque.dot(&r);
            let dphids = -torque.dot(&s);

            let du = ur * (dphidr / (ru * ursin)) + us * (dphids / ru);
            let dv = (s * vssin - t1 * vscos) * (dphidu / (rv * (ut1sin + ut2sin)));
            let dw = (s * wssin - t2 * wscos) * (dphidu / (rw * (ut1sin + ut2sin)));
            deposit(ia, du);
            deposit(ic, dv);
            if let Some(id) = id {
                deposit(id, dw);
            }
            deposit(i, -du - dv - dw);
        }
        FrameDefinition::Bisector => {
            let du = uv * (dphidv / (ru * uvsin)) + 0.5 * uw * (dphidw / ru);
            let dv = -uv * (dphidu / (rv * uvsin)) + 0.5 * vw * (dphidw / rv);
            deposit(ia, du);
            deposit(ic, dv);
            deposit(i, -du - dv);
        }
        // ZThenX; frameless sites never reach here.
        _ => {
            let du = uv * (dphidv / (ru * uvsin)) + uw * (dphidw / ru);
            let dv = -uv * (dphidu / (rv * uvsin));
            deposit(ia, du);
            deposit(ic, dv);
            deposit(i, -du - dv);
        }
    }
}
