//! Reference device exercised through the `Backend` trait object

use accel_backends::{Backend, EventStatus, MemFlags, QueuePriority, SimBackend};

fn upload(backend: &dyn Backend, data: &[f32]) -> accel_backends::Result<accel_backends::BufferHandle> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let queue = backend.create_queue(QueuePriority::Normal)?;
    let buffer = backend.create_buffer(MemFlags::READ_WRITE, bytes.len())?;
    // SAFETY: blocking write, `bytes` outlives the call
    unsafe { backend.enqueue_write(queue, buffer, true, 0, bytes.as_ptr(), bytes.len())? };
    backend.release_queue(queue)?;
    Ok(buffer)
}

#[test]
fn typed_data_survives_copy_and_fill() -> accel_backends::Result<()> {
    let sim = SimBackend::new();
    let backend: &dyn Backend = &sim;
    let queue = backend.create_queue(QueuePriority::High)?;

    let data: Vec<f32> = (0..256).map(|i| i as f32 * 0.5).collect();
    let src = upload(backend, &data)?;
    let dst = backend.create_buffer(MemFlags::READ_WRITE, data.len() * 4)?;

    backend.enqueue_copy(queue, src, dst, 0, 0, data.len() * 4)?;
    // Zero the second half with a 4-byte pattern.
    backend.enqueue_fill(queue, dst, &[0; 4], 512, 512)?;
    backend.finish(queue)?;

    let mut back = vec![0f32; data.len()];
    // SAFETY: blocking read into an owned vector
    unsafe {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut back);
        backend.enqueue_read(queue, dst, true, 0, bytes.as_mut_ptr(), bytes.len())?;
    }

    assert_eq!(&back[..128], &data[..128]);
    assert!(back[128..].iter().all(|&v| v == 0.0));

    for buffer in [src, dst] {
        backend.release_buffer(buffer)?;
    }
    backend.release_queue(queue)?;
    assert_eq!(sim.live_buffers(), 0);
    assert_eq!(sim.live_queues(), 0);
    Ok(())
}

#[test]
fn async_write_completes_before_marker() -> accel_backends::Result<()> {
    let sim = SimBackend::new();
    let queue = sim.create_queue(QueuePriority::Normal)?;
    let buffer = sim.create_buffer(MemFlags::READ_WRITE, 64)?;
    let values = [7u64; 8];
    let bytes: &[u8] = bytemuck::bytes_of(&values);

    // SAFETY: `values` lives until the marker below has completed
    unsafe { sim.enqueue_write(queue, buffer, false, 0, bytes.as_ptr(), bytes.len())? };
    let marker = sim.enqueue_marker(queue)?;
    sim.wait_for_events(&[marker])?;
    assert_eq!(sim.event_status(marker)?, EventStatus::Complete);

    let mut back = [0u64; 8];
    // SAFETY: blocking read
    unsafe {
        let out = bytemuck::bytes_of_mut(&mut back);
        sim.enqueue_read(queue, buffer, true, 0, out.as_mut_ptr(), out.len())?;
    }
    assert_eq!(back, values);

    sim.release_event(marker)?;
    sim.release_buffer(buffer)?;
    sim.release_queue(queue)
}
