#![warn(missing_docs)]

//! This package provides a function to estimate a 3D position
//! given distance measurements to three known reference points.
//!
//! This problem is generally known as [trilateration][trilateration].
//! We focus on the minimal case (exactly three reference points),
//! where the squared-distance equations form a square nonlinear system.
//! The solver refines a caller-supplied initial guess with
//! [Newton-Raphson iterations][newton], solving a 3x3 linearized system
//! at each step until the update falls below a tolerance.
//!
//! [trilateration]: https://en.wikipedia.org/wiki/True-range_multilateration
//! [newton]: https://en.wikipedia.org/wiki/Newton%27s_method

pub mod newton;
