// SPDX-License-Identifier: GPL-3.0-or-later

//! Sample-buffer façade (§4.2): the three operations every capturing instrument issues
//! against the device's single 10000-slot linear ADC buffer, chunked to keep the
//! firmware's UART FIFO from overflowing on long transfers.

use benchlink_protocol::{common, Primary};

use crate::error::Result;
use crate::transport::{Port, Transport};

/// Maximum number of samples moved in one round trip.
const CHUNK: u16 = 128;

/// Reads `count` samples starting at `offset` from the device's ADC buffer, in the
/// order stored.
pub fn fetch_buffer<P: Port>(transport: &mut Transport<P>, offset: u16, count: u16) -> Result<Vec<u16>> {
    let mut samples = Vec::with_capacity(count as usize);
    let mut remaining = count;
    let mut pos = offset;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        transport.send_u8(Primary::Common.into())?;
        transport.send_u8(common::RETRIEVE_BUFFER)?;
        transport.send_u16(pos)?;
        transport.send_u16(n)?;
        for _ in 0..n {
            samples.push(transport.get_u16()?);
        }
        transport.get_ack()?;
        pos += n;
        remaining -= n;
    }
    Ok(samples)
}

/// Zeroes `count` slots starting at `offset`, chunked the same as [`fetch_buffer`].
pub fn clear_buffer<P: Port>(transport: &mut Transport<P>, offset: u16, count: u16) -> Result<()> {
    let mut remaining = count;
    let mut pos = offset;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        transport.send_u8(Primary::Common.into())?;
        transport.send_u8(common::CLEAR_BUFFER)?;
        transport.send_u16(pos)?;
        transport.send_u16(n)?;
        transport.get_ack()?;
        pos += n;
        remaining -= n;
    }
    Ok(())
}

/// Writes `data` starting at `offset`, chunked the same as [`fetch_buffer`].
pub fn fill_buffer<P: Port>(transport: &mut Transport<P>, offset: u16, data: &[u16]) -> Result<()> {
    let mut pos = offset;
    for chunk in data.chunks(CHUNK as usize) {
        transport.send_u8(Primary::Common.into())?;
        transport.send_u8(common::FILL_BUFFER)?;
        transport.send_u16(pos)?;
        transport.send_u16(chunk.len() as u16)?;
        for &sample in chunk {
            transport.send_u16(sample)?;
        }
        transport.get_ack()?;
        pos += chunk.len() as u16;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::TransportConfig;

    fn harness() -> Transport<crate::transport::test::Loopback> {
        Transport::from_stream(
            crate::transport::test::Loopback::new(),
            TransportConfig::default(),
        )
    }

    #[test]
    fn fetch_buffer_chunks_at_128_samples() {
        let mut t = harness();
        // Two chunks: 128 + 32 samples, each followed by an ack.
        for chunk_len in [128usize, 32] {
            for i in 0..chunk_len {
                t.stream_for_test().queue(&(i as u16).to_le_bytes());
            }
            t.stream_for_test().queue(&[0x01]);
        }
        let samples = fetch_buffer(&mut t, 0, 160).unwrap();
        assert_eq!(samples.len(), 160);
        assert_eq!(samples[0], 0);
        assert_eq!(samples[128], 0);
    }

    #[test]
    fn fill_buffer_round_trips_chunk_boundaries() {
        let mut t = harness();
        t.stream_for_test().queue(&[0x01]);
        t.stream_for_test().queue(&[0x01]);
        let data: Vec<u16> = (0..130).collect();
        fill_buffer(&mut t, 0, &data).unwrap();
    }

    #[test]
    fn clear_buffer_chunks_and_acks_each_round_trip() {
        let mut t = harness();
        t.stream_for_test().queue(&[0x01]);
        t.stream_for_test().queue(&[0x01]);
        clear_buffer(&mut t, 0, 200).unwrap();
    }
}
