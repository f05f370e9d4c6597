//! Image captioning HTTP service.
//!
//! Serves `POST /caption-file` on top of an external inference runtime. Access to
//! the single accelerator is bounded by an admission gate, and the model weights are
//! acquired (or verified offline) once before the server starts.

pub mod web;
