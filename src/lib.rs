//! `dielectric-fit` library crate.
//!
//! Computational core for broadband dielectric spectroscopy:
//!
//! - `models`: the relaxation-model registry and complex-permittivity evaluation
//! - `kk`: Kramers–Kronig transforms and causality validation
//! - `fit`: robust bounded nonlinear least squares, multistart and model selection
//! - `diagnostics`: goodness of fit, residual tests and model autosuggestion
//!
//! File formats, plotting and user interfaces belong to the calling
//! application; everything here takes and returns plain data.

pub mod config;
pub mod data;
pub mod diagnostics;
pub mod domain;
pub mod error;
pub mod fit;
pub mod kk;
pub mod math;
pub mod models;
