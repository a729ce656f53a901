//! Static triangle-mesh boundaries and particle collision response.
//!
//! A [`BoundaryMesh`] stores every triangle as three consecutive vertices plus
//! one precomputed unit normal facing the fluid side. Collision tests sweep a
//! particle along its velocity for one timestep and classify the plane hit
//! with barycentric coordinates.

use glam::Vec3;

use super::error::SetupError;

/// Velocity components along a face normal smaller than this count as
/// parallel motion.
const PARALLEL_EPSILON: f32 = 1e-6;

/// Tolerance on barycentric classification so shared edges are not missed.
const BARYCENTRIC_EPSILON: f32 = 1e-5;

/// Triangles with a smaller doubled area are rejected.
const DEGENERATE_AREA: f32 = 1e-12;

/// Faces a single particle can be resolved against in one step.
pub const MAX_CONTACTS: usize = 8;

/// Result of a successful collision test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Contact {
    /// Unit normal of the hit face, pointing into the fluid.
    pub normal: Vec3,
    /// Barycentric coordinates `(u, v, w)` of `point` in the hit face.
    pub barycentric: Vec3,
    /// Point on the face plane where the particle touches it.
    pub point: Vec3,
    /// Index of the hit face.
    pub face: usize,
}

/// Immutable triangle mesh with inward normals.
#[derive(Clone, Debug)]
pub struct BoundaryMesh {
    vertices: Vec<Vec3>,
    normals: Vec<Vec3>,
}

impl BoundaryMesh {
    /// Builds a mesh from vertex triples.
    ///
    /// Each normal is oriented so it faces `interior`, a point known to lie on
    /// the fluid side of every face.
    pub fn new(vertices: Vec<Vec3>, interior: Vec3) -> Result<Self, SetupError> {
        if vertices.is_empty() {
            return Err(SetupError::EmptyMesh);
        }
        if vertices.len() % 3 != 0 {
            return Err(SetupError::IncompleteTriangle(vertices.len()));
        }

        let normals = vertices
            .chunks_exact(3)
            .enumerate()
            .map(|(face, tri)| {
                let cross = (tri[1] - tri[0]).cross(tri[2] - tri[0]);
                if cross.length_squared() < DEGENERATE_AREA {
                    return Err(SetupError::DegenerateTriangle(face));
                }
                let normal = cross.normalize();
                Ok(if normal.dot(interior - tri[0]) < 0.0 {
                    -normal
                } else {
                    normal
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { vertices, normals })
    }

    /// Closed box of edge lengths `size` centered on `origin`, 12 triangles,
    /// normals facing inside.
    pub fn box_mesh(size: Vec3, origin: Vec3) -> Result<Self, SetupError> {
        let h = size * 0.5;
        let corner = |x: f32, y: f32, z: f32| origin + Vec3::new(x, y, z) * h;

        // Each face as a quad of corners, split along its first diagonal.
        let quads = [
            [(-1., -1., -1.), (1., -1., -1.), (1., 1., -1.), (-1., 1., -1.)], // -z
            [(-1., -1., 1.), (1., -1., 1.), (1., 1., 1.), (-1., 1., 1.)],     // +z
            [(-1., -1., -1.), (1., -1., -1.), (1., -1., 1.), (-1., -1., 1.)], // -y
            [(-1., 1., -1.), (1., 1., -1.), (1., 1., 1.), (-1., 1., 1.)],     // +y
            [(-1., -1., -1.), (-1., 1., -1.), (-1., 1., 1.), (-1., -1., 1.)], // -x
            [(1., -1., -1.), (1., 1., -1.), (1., 1., 1.), (1., -1., 1.)],     // +x
        ];

        let mut vertices = Vec::with_capacity(36);
        for quad in quads {
            let [a, b, c, d] = quad.map(|(x, y, z)| corner(x, y, z));
            vertices.extend_from_slice(&[a, b, c, a, c, d]);
        }

        Self::new(vertices, origin)
    }

    pub fn face_count(&self) -> usize {
        self.normals.len()
    }

    pub fn triangle(&self, face: usize) -> [Vec3; 3] {
        let i = face * 3;
        [self.vertices[i], self.vertices[i + 1], self.vertices[i + 2]]
    }

    pub fn normal(&self, face: usize) -> Vec3 {
        self.normals[face]
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    /// First face the particle reaches within `dt`, ignoring `excluded`.
    ///
    /// A particle already closer than `radius` to a face plane is classified
    /// by its orthogonal projection; otherwise by where its velocity ray meets
    /// the plane. Motion parallel to or away from a face never collides.
    pub fn collision(
        &self,
        position: Vec3,
        velocity: Vec3,
        dt: f32,
        radius: f32,
        excluded: &[usize],
    ) -> Option<Contact> {
        (0..self.face_count())
            .filter(|face| !excluded.contains(face))
            .find_map(|face| self.face_contact(face, position, velocity, dt, radius))
    }

    fn face_contact(
        &self,
        face: usize,
        position: Vec3,
        velocity: Vec3,
        dt: f32,
        radius: f32,
    ) -> Option<Contact> {
        let normal = self.normals[face];
        let [a, b, c] = self.triangle(face);

        let approach = velocity.dot(normal);
        if approach.abs() < PARALLEL_EPSILON || approach > 0.0 {
            return None;
        }

        let distance = (position - a).dot(normal);
        if distance - radius > -approach * dt {
            return None;
        }

        let point = if distance <= radius {
            position - normal * distance
        } else {
            position + velocity * (distance / -approach)
        };

        let barycentric = barycentric(point, a, b, c)?;
        Some(Contact {
            normal,
            barycentric,
            point,
            face,
        })
    }

    /// Resolves every contact of one particle for this step.
    ///
    /// Each hit face is excluded from the following tests so a particle in a
    /// corner is pushed off every face it touches. Returns the number of
    /// contacts resolved.
    pub fn resolve(
        &self,
        position: &mut Vec3,
        velocity: &mut Vec3,
        force: &mut Vec3,
        dt: f32,
        radius: f32,
        response: &ContactResponse,
    ) -> usize {
        let mut excluded = ExcludedFaces::default();
        let bound = self.face_count().min(MAX_CONTACTS);

        while excluded.len() < bound {
            let Some(contact) = self.collision(*position, *velocity, dt, radius, excluded.as_slice())
            else {
                break;
            };
            *velocity = response.velocity(contact.normal, *velocity);
            *force = response.force(contact.normal, *force);
            *position = contact.point + contact.normal * radius;
            excluded.push(contact.face);
        }

        excluded.len()
    }
}

/// Barycentric coordinates of `p` in triangle `abc`, or `None` when outside.
fn barycentric(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<Vec3> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d00 = ab.dot(ab);
    let d01 = ab.dot(ac);
    let d11 = ac.dot(ac);
    let d20 = ap.dot(ab);
    let d21 = ap.dot(ac);

    let denom = d00 * d11 - d01 * d01;
    if denom.abs() < f32::EPSILON {
        return None;
    }

    let v = (d11 * d20 - d01 * d21) / denom;
    let w = (d00 * d21 - d01 * d20) / denom;
    let u = 1.0 - v - w;

    let inside = v >= -BARYCENTRIC_EPSILON
        && w >= -BARYCENTRIC_EPSILON
        && v + w <= 1.0 + BARYCENTRIC_EPSILON;
    inside.then(|| Vec3::new(u, v, w).max(Vec3::ZERO))
}

/// Fixed-capacity set of faces already resolved for one particle.
#[derive(Debug, Default)]
struct ExcludedFaces {
    faces: [usize; MAX_CONTACTS],
    len: usize,
}

impl ExcludedFaces {
    fn len(&self) -> usize {
        self.len
    }

    fn push(&mut self, face: usize) {
        if self.len < MAX_CONTACTS {
            self.faces[self.len] = face;
            self.len += 1;
        }
    }

    fn as_slice(&self) -> &[usize] {
        &self.faces[..self.len]
    }
}

/// Restitution and friction applied on boundary contact.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContactResponse {
    /// Fraction of normal speed kept after the bounce.
    pub restitution: f32,
    /// Tangential damping per unit of normal impulse.
    pub friction: f32,
}

impl Default for ContactResponse {
    fn default() -> Self {
        Self {
            restitution: 0.45,
            friction: 0.1,
        }
    }
}

impl ContactResponse {
    pub fn new(restitution: f32, friction: f32) -> Self {
        Self {
            restitution,
            friction,
        }
    }

    /// Post-contact velocity for a face with unit `normal`.
    pub fn velocity(&self, normal: Vec3, velocity: Vec3) -> Vec3 {
        let normal_part = normal * normal.dot(velocity);
        let mut tangent = velocity - normal_part;

        let tangent_speed = tangent.length();
        if tangent_speed > 0.0 {
            let impulse = (normal_part * (-self.restitution - 1.0)).length();
            tangent *= (1.0 - self.friction * impulse / tangent_speed).max(0.0);
        }

        tangent - normal_part * self.restitution
    }

    /// Drops the component of `force` pushing into the face.
    pub fn force(&self, normal: Vec3, force: Vec3) -> Vec3 {
        let into = force.dot(normal);
        if into < 0.0 {
            force - normal * into
        } else {
            force
        }
    }
}
