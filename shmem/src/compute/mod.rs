use std::str;

use crate::core::PAYLOAD_CAPACITY;
use crate::errors::ComputeError;

/// The work the worker process performs on a request.
///
/// Implementations must be deterministic and terminate. An error is fatal
/// for the worker: nothing gets committed or signaled after it.
pub trait WorkerBody {
    fn compute(&self, request: &[u8]) -> Result<Vec<u8>, ComputeError>;
}

impl<F> WorkerBody for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, ComputeError>,
{
    fn compute(&self, request: &[u8]) -> Result<Vec<u8>, ComputeError> {
        self(request)
    }
}

/// Sums the numbers on every line of the request, one `Sum: x.yy` line each.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineSums;

impl WorkerBody for LineSums {
    fn compute(&self, request: &[u8]) -> Result<Vec<u8>, ComputeError> {
        let mut response = Vec::new();
        for (index, line) in request.split(|b| *b == b'\n').enumerate() {
            if let Some(sum) = sum_line(line, index + 1)? {
                response.extend_from_slice(format_sum(sum).as_bytes());
            }
        }
        if response.len() > PAYLOAD_CAPACITY {
            return Err(ComputeError::ResponseTooLarge {
                len: response.len(),
                capacity: PAYLOAD_CAPACITY,
            });
        }
        Ok(response)
    }
}

/// `None` for a line without any number on it.
pub fn sum_line(line: &[u8], line_no: usize) -> Result<Option<f32>, ComputeError> {
    let mut sum = None;
    for token in line.split(|b| b.is_ascii_whitespace()).filter(|t| !t.is_empty()) {
        let value = parse_token(token, line_no)?;
        let total = sum.unwrap_or(0.0f32) + value;
        if total.is_infinite() {
            return Err(ComputeError::Overflow { line: line_no });
        }
        sum = Some(total);
    }
    Ok(sum)
}

#[inline]
fn parse_token(token: &[u8], line_no: usize) -> Result<f32, ComputeError> {
    let malformed = || ComputeError::MalformedToken {
        line: line_no,
        token: String::from_utf8_lossy(token).into_owned(),
    };
    let value = str::from_utf8(token)
        .ok()
        .and_then(|text| text.parse::<f32>().ok())
        .ok_or_else(malformed)?;
    if value.is_nan() {
        return Err(malformed());
    }
    if value.is_infinite() || underflows(token, value) {
        return Err(ComputeError::Overflow { line: line_no });
    }
    Ok(value)
}

/// A nonzero literal that only fits as zero or as a subnormal `f32`.
#[inline]
fn underflows(token: &[u8], value: f32) -> bool {
    if value.is_normal() {
        return false;
    }
    if value != 0.0 {
        return true;
    }
    token
        .iter()
        .take_while(|b| **b != b'e' && **b != b'E')
        .any(|b| (b'1'..=b'9').contains(b))
}

pub fn format_sum(sum: f32) -> String {
    format!("Sum: {:.2}\n", sum)
}
