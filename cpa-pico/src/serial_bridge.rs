//! Transparent bridge between the DUT-facing UART and a pair of bulk
//! endpoints.
//!
//! The DUT→host direction batches: UART bytes land in a staging buffer and
//! only go out once enough have piled up or they have been sitting idle too
//! long, so a chatty DUT does not turn into one USB packet per byte. The
//! host→DUT direction is a plain copy.

use cpa_protocol::bridge::FlushPolicy;
use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_rp::peripherals::UART0;
use embassy_rp::uart::{BufferedUartRx, BufferedUartTx};
use embassy_time::Timer;
use embassy_usb::driver::{Endpoint as _, EndpointError, EndpointIn as _, EndpointOut as _};
use embedded_io_async::{Read, Write};

use crate::config::*;
use crate::{BulkIn, BulkOut};

#[embassy_executor::task]
pub async fn dut_to_host_task(mut rx: BufferedUartRx<'static, UART0>, mut ep_in: BulkIn) {
    let mut staging = [0u8; BRIDGE_BUF_SIZE];
    let mut policy = FlushPolicy::new(BRIDGE_FLUSH_WATERMARK, BRIDGE_IDLE_BOUND);

    loop {
        ep_in.wait_enabled().await;
        info!("serial bridge IN endpoint up");

        // Bytes staged before the endpoint came up belong to no session.
        let mut filled = 0usize;
        policy.flushed();

        loop {
            if filled == 0 {
                // Nothing staged; sleep until the DUT talks.
                match rx.read(&mut staging).await {
                    Ok(n) => {
                        filled += n;
                        policy.on_receive(n);
                    }
                    Err(e) => warn!("bridge UART rx error: {:?}", e),
                }
            } else {
                match select(
                    rx.read(&mut staging[filled..]),
                    Timer::after_micros(BRIDGE_POLL_TICK_US),
                )
                .await
                {
                    Either::First(Ok(n)) => {
                        filled += n;
                        policy.on_receive(n);
                    }
                    Either::First(Err(e)) => warn!("bridge UART rx error: {:?}", e),
                    Either::Second(()) => {}
                }

                if policy.poll() {
                    let mut dropped = false;
                    for chunk in staging[..filled].chunks(USB_MAX_PACKET_SIZE as usize) {
                        if ep_in.write(chunk).await.is_err() {
                            dropped = true;
                            break;
                        }
                    }
                    filled = 0;
                    policy.flushed();
                    if dropped {
                        // Endpoint went down; drop the batch and re-arm.
                        warn!("serial bridge IN endpoint dropped a batch");
                        break;
                    }
                }
            }
        }
    }
}

#[embassy_executor::task]
pub async fn host_to_dut_task(mut ep_out: BulkOut, mut tx: BufferedUartTx<'static, UART0>) {
    let mut buf = [0u8; USB_MAX_PACKET_SIZE as usize];

    loop {
        ep_out.wait_enabled().await;
        info!("serial bridge OUT endpoint up");

        loop {
            match ep_out.read(&mut buf).await {
                Ok(n) => {
                    if tx.write_all(&buf[..n]).await.is_err() {
                        warn!("bridge UART tx error");
                    }
                }
                Err(EndpointError::Disabled) => break,
                Err(EndpointError::BufferOverflow) => warn!("bridge OUT packet overflow"),
            }
        }
    }
}
