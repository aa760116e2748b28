//! Expression operator backed by Rhai scripts
//!
//! Two scripts drive the operator:
//!
//! - The **begin** script runs once while the graph is built. Every input is
//!   in scope as an object map with `unit`, `size`, `lower_limits` and
//!   `upper_limits`. The script returns a flat array with five entries per
//!   output: `name, unit, size, lower, upper`. `lower` and `upper` are either
//!   both numbers (applied to every element) or both arrays of `size`
//!   numbers.
//!
//! - The **step** script runs every event. Inputs are in scope as arrays of
//!   floats under their names, outputs as arrays under the names declared by
//!   the begin script. Whatever the script leaves in the output arrays is
//!   copied back into the output pipes.
//!
//! Both scripts can call `is_valid(x)`, `is_invalid(x)` and `invalid()`.
//!
//! ```rhai
//! // begin
//! [ "sum", a.unit, 1, 0.0, a.upper_limits[0] * a.size ]
//!
//! // step
//! let s = 0.0;
//! for v in a { if is_valid(v) { s += v; } }
//! sum[0] = s;
//! ```

use super::{Operator, OperatorKind};
use crate::error::{A2Error, Result, ResultExt};
use crate::memory::Arena;
use crate::param::{invalid_param, invalidate_all, is_param_valid, PipeVectors};
use rhai::{Array, Dynamic, Engine, Map, Scope, AST};
use std::collections::HashSet;

/// One named input of an expression operator.
#[derive(Debug, Clone)]
pub struct ExpressionInput {
    pub pipe: PipeVectors,
    pub name: String,
    pub unit: String,
}

/// Output declared by the begin script.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionOutput {
    pub name: String,
    pub unit: String,
    pub lower_limits: Vec<f64>,
    pub upper_limits: Vec<f64>,
}

impl ExpressionOutput {
    pub fn size(&self) -> usize {
        self.lower_limits.len()
    }
}

pub struct ExpressionOperator {
    engine: Engine,
    step_ast: AST,
    input_names: Vec<String>,
    outputs: Vec<ExpressionOutput>,
    scope: Scope<'static>,
    last_error: Option<String>,
}

impl std::fmt::Debug for ExpressionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionOperator")
            .field("inputs", &self.input_names)
            .field("outputs", &self.outputs)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

fn create_engine() -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(32);
    engine.set_max_operations(1_000_000);
    engine.set_max_string_size(10_000);
    engine.set_max_array_size(65_536);
    engine.set_max_map_size(1_000);

    engine.register_fn("is_valid", |x: f64| is_param_valid(x));
    engine.register_fn("is_valid", |x: i64| is_param_valid(x as f64));
    engine.register_fn("is_invalid", |x: f64| !is_param_valid(x));
    engine.register_fn("invalid", invalid_param);

    engine
}

fn as_number(d: &Dynamic) -> Option<f64> {
    d.as_float()
        .ok()
        .or_else(|| d.as_int().ok().map(|i| i as f64))
}

fn float_array(values: impl IntoIterator<Item = f64>) -> Array {
    values.into_iter().map(Dynamic::from_float).collect()
}

fn expr_err(msg: impl Into<String>) -> A2Error {
    A2Error::Expression(msg.into())
}

/// Expand a scalar or array limit value to `size` values.
fn limit_values(limit: &Dynamic, size: usize, what: &str, output: &str) -> Result<Vec<f64>> {
    if let Some(v) = as_number(limit) {
        return Ok(vec![v; size]);
    }

    let arr = limit
        .clone()
        .into_array()
        .map_err(|_| expr_err(format!("output '{}': {} must be a number or an array", output, what)))?;

    if arr.len() != size {
        return Err(expr_err(format!(
            "output '{}': {} has {} entries, expected {}",
            output,
            what,
            arr.len(),
            size
        )));
    }

    arr.iter()
        .map(|d| {
            as_number(d).ok_or_else(|| {
                expr_err(format!("output '{}': {} must contain numbers", output, what))
            })
        })
        .collect()
}

/// Validate the begin script's result.
fn parse_output_definitions(result: Dynamic) -> Result<Vec<ExpressionOutput>> {
    let items = result
        .into_array()
        .map_err(|_| expr_err("begin script must return an array"))?;

    if items.is_empty() || items.len() % 5 != 0 {
        return Err(expr_err(format!(
            "begin script must return 5 values per output, got {}",
            items.len()
        )));
    }

    let mut outputs = Vec::with_capacity(items.len() / 5);
    let mut seen = HashSet::new();

    for chunk in items.chunks_exact(5) {
        let name = chunk[0]
            .clone()
            .into_string()
            .map_err(|_| expr_err("output name must be a string"))?;
        if name.is_empty() {
            return Err(expr_err("output name must not be empty"));
        }
        if !seen.insert(name.clone()) {
            return Err(expr_err(format!("duplicate output name '{}'", name)));
        }

        let unit = chunk[1]
            .clone()
            .into_string()
            .map_err(|_| expr_err(format!("output '{}': unit must be a string", name)))?;

        let size = chunk[2]
            .as_int()
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| expr_err(format!("output '{}': size must be a positive integer", name)))?
            as usize;

        let (lower, upper) = (&chunk[3], &chunk[4]);
        if lower.is_array() != upper.is_array() {
            return Err(expr_err(format!(
                "output '{}': lower and upper limits must both be scalars or both be arrays",
                name
            )));
        }

        outputs.push(ExpressionOutput {
            lower_limits: limit_values(lower, size, "lower limit", &name)?,
            upper_limits: limit_values(upper, size, "upper limit", &name)?,
            name,
            unit,
        });
    }

    Ok(outputs)
}

impl ExpressionOperator {
    pub fn outputs(&self) -> &[ExpressionOutput] {
        &self.outputs
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], outputs: &[PipeVectors]) {
        self.scope.rewind(0);

        for (name, pipe) in self.input_names.iter().zip(inputs) {
            let values = arena.get(pipe.data).iter().map(|c| c.get());
            self.scope.push(name.clone(), float_array(values));
        }
        for (def, pipe) in self.outputs.iter().zip(outputs) {
            let values = arena.get(pipe.data).iter().map(|c| c.get());
            self.scope.push(def.name.clone(), float_array(values));
        }

        if let Err(e) = self
            .engine
            .run_ast_with_scope(&mut self.scope, &self.step_ast)
        {
            let msg = e.to_string();
            if self.last_error.as_deref() != Some(msg.as_str()) {
                tracing::warn!("Expression step failed: {}", msg);
            }
            self.last_error = Some(msg);
            for pipe in outputs {
                invalidate_all(arena.get(pipe.data));
            }
            return;
        }

        for (def, pipe) in self.outputs.iter().zip(outputs) {
            let out = arena.get(pipe.data);
            match self.scope.get_value::<Array>(&def.name) {
                Some(values) => {
                    for (i, cell) in out.iter().enumerate() {
                        cell.set(values.get(i).and_then(as_number).unwrap_or_else(invalid_param));
                    }
                }
                None => invalidate_all(out),
            }
        }
    }
}

impl Operator {
    /// Compile both scripts, evaluate the begin script and allocate the
    /// declared outputs.
    pub fn expression(
        arena: &mut Arena,
        inputs: Vec<ExpressionInput>,
        begin_script: &str,
        step_script: &str,
    ) -> Result<Operator> {
        let engine = create_engine();

        let begin_ast = engine
            .compile(begin_script)
            .map_err(|e| expr_err(format!("begin script: {}", e)))?;
        let step_ast = engine
            .compile(step_script)
            .map_err(|e| expr_err(format!("step script: {}", e)))?;

        let mut scope = Scope::new();
        for input in &inputs {
            let mut m = Map::new();
            m.insert("unit".into(), input.unit.clone().into());
            m.insert("size".into(), Dynamic::from_int(input.pipe.len() as i64));
            m.insert(
                "lower_limits".into(),
                float_array(arena.values(input.pipe.lower_limits)).into(),
            );
            m.insert(
                "upper_limits".into(),
                float_array(arena.values(input.pipe.upper_limits)).into(),
            );
            scope.push(input.name.clone(), m);
        }

        let result = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &begin_ast)
            .context("begin script")?;
        let defs = parse_output_definitions(result)?;

        let input_names: Vec<String> = inputs.iter().map(|i| i.name.clone()).collect();
        if let Some(def) = defs.iter().find(|d| input_names.contains(&d.name)) {
            return Err(expr_err(format!(
                "output '{}' shadows an input of the same name",
                def.name
            )));
        }

        let mut outputs = Vec::with_capacity(defs.len());
        for def in &defs {
            let pipe = PipeVectors::push(arena, def.size(), 0.0, 0.0)?;
            arena.copy_from(pipe.lower_limits, &def.lower_limits);
            arena.copy_from(pipe.upper_limits, &def.upper_limits);
            outputs.push(pipe);
        }

        tracing::debug!(
            "Expression operator: {} inputs, outputs {:?}",
            input_names.len(),
            defs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
        );

        Ok(Operator::new(
            OperatorKind::Expression(Box::new(ExpressionOperator {
                engine,
                step_ast,
                input_names,
                outputs: defs,
                scope: Scope::new(),
                last_error: None,
            })),
            inputs.into_iter().map(|i| i.pipe).collect(),
            outputs,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{pipe, step};
    use super::*;

    fn input(arena: &mut Arena, name: &str, values: &[f64]) -> ExpressionInput {
        ExpressionInput {
            pipe: pipe(arena, values, 0.0, 10.0),
            name: name.to_string(),
            unit: "ns".to_string(),
        }
    }

    #[test]
    fn test_scalar_limits() {
        let mut arena = Arena::new(64 * 1024);
        let a = input(&mut arena, "a", &[1.0, 2.0, invalid_param()]);
        let op = Operator::expression(
            &mut arena,
            vec![a],
            r#"[ "doubled", a.unit, a.size, 0.0, a.upper_limits[0] * 2.0 ]"#,
            "",
        )
        .unwrap();

        let OperatorKind::Expression(e) = &op.kind else {
            panic!("not an expression operator");
        };
        assert_eq!(e.outputs()[0].name, "doubled");
        assert_eq!(e.outputs()[0].unit, "ns");
        assert_eq!(op.outputs[0].len(), 3);
        assert_eq!(arena.values(op.outputs[0].upper_limits), vec![20.0; 3]);
    }

    #[test]
    fn test_step_writes_outputs() {
        let mut arena = Arena::new(64 * 1024);
        let a = input(&mut arena, "a", &[1.0, 2.0, invalid_param()]);
        let mut op = Operator::expression(
            &mut arena,
            vec![a],
            r#"[ "doubled", "ns", 3, 0.0, 20.0, "total", "ns", 1, [0.0], [30.0] ]"#,
            r#"
                let s = 0.0;
                for i in 0..a.len() {
                    if is_valid(a[i]) {
                        doubled[i] = a[i] * 2.0;
                        s += a[i];
                    } else {
                        doubled[i] = invalid();
                    }
                }
                total[0] = s;
            "#,
        )
        .unwrap();

        step(&mut op, &arena);
        let doubled = arena.values(op.outputs[0].data);
        assert_eq!(doubled[..2], [2.0, 4.0]);
        assert!(!is_param_valid(doubled[2]));
        assert_eq!(arena.value(op.outputs[1].data, 0), 3.0);
    }

    #[test]
    fn test_mixed_limit_kinds_rejected() {
        let mut arena = Arena::new(64 * 1024);
        let a = input(&mut arena, "a", &[1.0]);
        let err = Operator::expression(&mut arena, vec![a], r#"[ "x", "", 2, 0.0, [1.0, 2.0] ]"#, "")
            .unwrap_err();
        assert!(matches!(err, A2Error::Expression(_)));
    }

    #[test]
    fn test_wrong_limit_length_rejected() {
        let mut arena = Arena::new(64 * 1024);
        let a = input(&mut arena, "a", &[1.0]);
        let err = Operator::expression(
            &mut arena,
            vec![a],
            r#"[ "x", "", 2, [0.0], [1.0] ]"#,
            "",
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_bad_tuple_count_rejected() {
        let mut arena = Arena::new(64 * 1024);
        let a = input(&mut arena, "a", &[1.0]);
        assert!(Operator::expression(&mut arena, vec![a.clone()], r#"[ "x", "", 1, 0.0 ]"#, "").is_err());
        assert!(Operator::expression(&mut arena, vec![a], "let x = ;", "").is_err());
    }

    #[test]
    fn test_runtime_error_invalidates_outputs() {
        let mut arena = Arena::new(64 * 1024);
        let a = input(&mut arena, "a", &[1.0]);
        let mut op = Operator::expression(
            &mut arena,
            vec![a],
            r#"[ "y", "", 1, 0.0, 1.0 ]"#,
            r#"y[0] = 1.0; throw "boom";"#,
        )
        .unwrap();

        step(&mut op, &arena);
        assert!(!is_param_valid(arena.value(op.outputs[0].data, 0)));
        let OperatorKind::Expression(e) = &op.kind else {
            panic!("not an expression operator");
        };
        assert!(e.last_error().unwrap().contains("boom"));
    }
}
