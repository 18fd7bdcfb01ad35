// SPDX-License-Identifier: GPL-3.0-or-later

//! Multimeter (§4.5): averaged voltage, resistance and two capacitance-measurement
//! algorithms built on top of single-channel 12-bit oscilloscope captures.

use std::thread;
use std::time::{Duration, Instant};

use benchlink_protocol::{common, Primary};
use log::info;

use crate::channel::GAIN_VALUES;
use crate::error::{Error, Result};
use crate::oscilloscope::Oscilloscope;
use crate::transport::Port;

const CURRENTS: [f64; 4] = [5.5e-4, 5.5e-7, 5.5e-6, 5.5e-5];
/// Iteration order over [`CURRENTS`]: smallest current first.
const CURRENTS_RANGES: [u8; 4] = [1, 2, 3, 0];
const RC_RESISTANCE: f64 = 1e4;
const PULL_UP_RESISTANCE: f64 = 5.1e3;
const MICROSECONDS: f64 = 1e-6;

pub struct Multimeter<P: Port> {
    scope: Oscilloscope<P>,
    stray_capacitance: f64,
    capacitor_charged_voltage: f64,
    capacitor_discharged_voltage: f64,
}

impl<P: Port> Multimeter<P> {
    pub fn new(scope: Oscilloscope<P>) -> Result<Self> {
        let full_scale = scope.channel("CAP")?.full_scale();
        Ok(Multimeter {
            scope,
            stray_capacitance: 46e-12,
            capacitor_charged_voltage: 0.9 * full_scale,
            capacitor_discharged_voltage: 0.01 * full_scale,
        })
    }

    pub fn oscilloscope(&self) -> &Oscilloscope<P> {
        &self.scope
    }

    pub fn oscilloscope_mut(&mut self) -> &mut Oscilloscope<P> {
        &mut self.scope
    }

    pub fn measure_resistance(&mut self) -> Result<f64> {
        let voltage = self.measure_voltage("RES")?;
        let ch = self.scope.channel("RES")?;
        let resolution = ch.full_scale() / ((1u32 << ch.resolution()) - 1) as f64;
        let range_high = ch.full_scale();
        if voltage >= range_high - resolution {
            return Ok(f64::INFINITY);
        }
        let current = (range_high - voltage) / PULL_UP_RESISTANCE;
        Ok(voltage / current)
    }

    pub fn measure_voltage(&mut self, channel: &str) -> Result<f64> {
        self.voltmeter_autorange(channel)?;
        self.measure_voltage_raw(channel)
    }

    fn measure_voltage_raw(&mut self, channel: &str) -> Result<f64> {
        self.scope.channel_mut(channel)?.set_resolution(12)?;
        let chosa = self.scope.channel(channel)?.mux;
        let sum = {
            let transport = self.scope.transport().clone();
            let mut t = transport.borrow_mut();
            t.send_u8(Primary::Adc.into())?;
            t.send_u8(benchlink_protocol::adc::GET_VOLTAGE_SUMMED)?;
            t.send_u8(chosa)?;
            let sum = t.get_u16()?;
            t.get_ack()?;
            sum
        };
        let mean = (sum as f64 / 16.0).round() as u32;
        Ok(self.scope.channel(channel)?.scale(mean))
    }

    fn voltmeter_autorange(&mut self, channel: &str) -> Result<f64> {
        if channel == "CH1" || channel == "CH2" {
            self.scope.set_gain(channel, 1)?;
            let voltage = self.measure_voltage_raw(channel)?;
            let full_scale = self.scope.channel(channel)?.full_scale();
            let mut range = full_scale;
            let mut chosen = 1;
            for &gain in GAIN_VALUES.iter().rev() {
                range = full_scale / gain as f64;
                if voltage.abs() < range {
                    chosen = gain;
                    break;
                }
            }
            self.scope.set_gain(channel, chosen)?;
            Ok(range)
        } else {
            Ok(self.scope.channel(channel)?.full_scale())
        }
    }

    /// Charges a no-DUT pin with known current and short charge times in a log-spaced
    /// sweep, updating the stray-capacitance constant used by every capacitance
    /// measurement.
    pub fn calibrate_capacitance(&mut self) -> Result<()> {
        for charge_time in logspace_us(100, 1000) {
            self.discharge_capacitor(50_000, Duration::from_secs(1))?;
            let (voltage, capacitance) = self.measure_capacitance_once(1, 0, charge_time)?;
            if voltage >= self.capacitor_charged_voltage {
                self.stray_capacitance += capacitance;
                info!("recalibrated stray capacitance: {:e} F", self.stray_capacitance);
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn measure_capacitance(&mut self) -> Result<f64> {
        for &current_range in CURRENTS_RANGES.iter() {
            let mut charge_time: u32 = 10;
            for _ in 0..10 {
                if charge_time > 50_000 {
                    break;
                }
                let (voltage, capacitance) =
                    self.measure_capacitance_once(current_range, 0, charge_time)?;
                if voltage > 0.0 {
                    let ratio = voltage / self.capacitor_charged_voltage;
                    if (0.98..1.02).contains(&ratio) {
                        return Ok(capacitance);
                    }
                    charge_time = (charge_time as f64 * self.capacitor_charged_voltage / voltage) as u32;
                }
            }
        }
        self.measure_rc_capacitance()
    }

    fn set_cap(&mut self, state: u8, charge_time: u16) -> Result<()> {
        let transport = self.scope.transport().clone();
        let mut t = transport.borrow_mut();
        t.send_u8(Primary::Adc.into())?;
        t.send_u8(benchlink_protocol::adc::SET_CAP)?;
        t.send_u8(state)?;
        t.send_u16(charge_time)?;
        t.get_ack()?;
        Ok(())
    }

    fn discharge_capacitor(&mut self, discharge_time: u16, timeout: Duration) -> Result<f64> {
        let start = Instant::now();
        let mut voltage = self.measure_voltage("CAP")?;
        let mut previous = voltage;
        while voltage > self.capacitor_discharged_voltage {
            self.set_cap(0, discharge_time)?;
            voltage = self.measure_voltage("CAP")?;
            if (previous - voltage).abs() < self.capacitor_discharged_voltage {
                break;
            }
            previous = voltage;
            if start.elapsed() > timeout {
                break;
            }
        }
        Ok(voltage)
    }

    fn measure_capacitance_once(
        &mut self,
        current_range: u8,
        trim: i32,
        charge_time: u32,
    ) -> Result<(f64, f64)> {
        self.discharge_capacitor(50_000, Duration::from_secs(1))?;
        self.scope.channel_mut("CAP")?.set_resolution(12)?;
        let raw = {
            let transport = self.scope.transport().clone();
            let mut t = transport.borrow_mut();
            t.send_u8(Primary::Common.into())?;
            t.send_u8(common::GET_CAPACITANCE)?;
            t.send_u8(current_range)?;
            if trim < 0 {
                t.send_u8((31 - (trim.abs() / 2)) as u8 | 32)?;
            } else {
                t.send_u8((trim / 2) as u8)?;
            }
            t.send_u16(charge_time as u16)?;
            drop(t);
            thread::sleep(Duration::from_secs_f64(charge_time as f64 * MICROSECONDS));
            let mut t = transport.borrow_mut();
            let raw = t.get_u16()?;
            t.get_ack()?;
            raw
        };
        let voltage = self.scope.channel("CAP")?.scale(raw as u32);
        let charge_current = CURRENTS[current_range as usize] * (100 + trim) as f64 / 100.0;
        let capacitance = if voltage != 0.0 {
            charge_current * charge_time as f64 * MICROSECONDS / voltage - self.stray_capacitance
        } else {
            0.0
        };
        Ok((voltage, capacitance))
    }

    /// Fallback used when the constant-current search can't converge: capture the
    /// discharge curve through a 10 kOhm resistor and fit an exponential.
    fn measure_rc_capacitance(&mut self) -> Result<f64> {
        self.scope
            .capture_nonblocking(1, benchlink_protocol::MAX_SAMPLES, 10.0, false)?;
        self.set_cap(1, 50_000)?;
        self.set_cap(0, 50_000)?;
        let data = self.scope.fetch_data()?;
        let mut x: Vec<f64> = data.x_us.iter().map(|&t| t * MICROSECONDS).collect();
        let mut y = data.y_volts[0].clone();

        let discharge_start = if y.iter().cloned().fold(f64::MIN, f64::max) >= self.capacitor_charged_voltage {
            y.iter()
                .rposition(|&v| v >= self.capacitor_charged_voltage)
                .unwrap_or(0)
        } else {
            let max = y.iter().cloned().fold(f64::MIN, f64::max);
            y.iter().rposition(|&v| v == max).unwrap_or(0)
        };
        x = x[discharge_start..].to_vec();
        y = y[discharge_start..].to_vec();

        if x.len() < 3 {
            return Err(Error::ArgumentError(
                "insufficient samples to fit RC discharge curve".into(),
            ));
        }

        let dydx: Vec<f64> = (1..x.len()).map(|i| (y[i] - y[i - 1]) / (x[i] - x[i - 1])).collect();
        let min_dydx = dydx.iter().cloned().fold(f64::MAX, f64::min);
        let cap_low = dydx.iter().position(|&d| d == min_dydx).unwrap_or(0);
        x = x[cap_low..].to_vec();
        y = y[cap_low..].to_vec();

        if let Some(v_zero) = y.iter().position(|&v| v == 0.0) {
            x.truncate(v_zero);
            y.truncate(v_zero);
        }

        let x0 = x.first().copied().unwrap_or(0.0);
        for v in x.iter_mut() {
            *v -= x0;
        }

        let tau = fit_rc_time_constant(&x, &y)?;
        Ok(tau / RC_RESISTANCE)
    }
}

/// Fits `V(t) = V0 * exp(-t/tau)` by linearising: `ln(V) = ln(V0) - t/tau`, solved with
/// ordinary least squares on `(t, ln(V))`. No external curve-fitting dependency is
/// introduced for this two-parameter exponential (`SPEC_FULL.md` §4.5).
fn fit_rc_time_constant(x: &[f64], y: &[f64]) -> Result<f64> {
    let points: Vec<(f64, f64)> = x
        .iter()
        .zip(y.iter())
        .filter(|(_, &v)| v > 0.0)
        .map(|(&t, &v)| (t, v.ln()))
        .collect();
    if points.len() < 2 {
        return Err(Error::ArgumentError(
            "insufficient positive samples to fit RC discharge curve".into(),
        ));
    }
    let n = points.len() as f64;
    let x_bar = points.iter().map(|(t, _)| t).sum::<f64>() / n;
    let y_bar = points.iter().map(|(_, v)| v).sum::<f64>() / n;
    let num: f64 = points.iter().map(|(t, v)| (t - x_bar) * (v - y_bar)).sum();
    let den: f64 = points.iter().map(|(t, _)| (t - x_bar).powi(2)).sum();
    if den == 0.0 {
        return Err(Error::ArgumentError("degenerate RC discharge curve".into()));
    }
    let slope = num / den;
    if slope >= 0.0 {
        return Err(Error::ArgumentError(
            "RC discharge curve is not decaying".into(),
        ));
    }
    Ok(-1.0 / slope)
}

fn logspace_us(start_exp: i32, end_exp: i32) -> Vec<u16> {
    let n = 50;
    let mut values: Vec<u16> = (0..n)
        .map(|i| {
            let t = start_exp as f64 + (end_exp - start_exp) as f64 * i as f64 / (n - 1) as f64;
            10f64.powf(t) as u16
        })
        .collect();
    values.sort_unstable();
    values.dedup();
    values
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fit_rc_time_constant_recovers_known_tau() {
        let tau = 2.0e-3;
        let v0 = 2.5;
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 1e-4).collect();
        let y: Vec<f64> = x.iter().map(|&t| v0 * (-t / tau).exp()).collect();
        let fitted = fit_rc_time_constant(&x, &y).unwrap();
        assert!((fitted - tau).abs() / tau < 1e-6);
    }

    #[test]
    fn logspace_us_is_sorted_and_deduplicated() {
        let values = logspace_us(2, 3);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.first().copied(), Some(100));
        assert_eq!(values.last().copied(), Some(1000));
    }
}
